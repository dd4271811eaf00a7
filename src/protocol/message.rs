//! Decoded message shapes. Only the fields the proxy actually inspects are
//! modeled; everything else stays in the opaque [`super::frame::RawFrame`]
//! body and is forwarded unexamined.

use bytes::Bytes;

/// The three server-initiated event kinds named in spec §4.3.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SchemaChange,
    StatusChange,
    TopologyChange,
}

/// A query's intent, as classified by [`crate::inspector`] from its opcode
/// and (for `Query`/`Prepare`/`Batch`) the leading keyword of the CQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
    /// `USE <keyspace>`.
    SetKeyspace,
}

/// CQL error codes this proxy constructs or recognizes by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unprepared,
    ReadTimeout,
    WriteTimeout,
    Other(u32),
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x2500 => ErrorCode::Unprepared,
            0x1200 => ErrorCode::ReadTimeout,
            0x1100 => ErrorCode::WriteTimeout,
            other => ErrorCode::Other(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            ErrorCode::Unprepared => 0x2500,
            ErrorCode::ReadTimeout => 0x1200,
            ErrorCode::WriteTimeout => 0x1100,
            ErrorCode::Other(v) => v,
        }
    }
}

/// The subset of `RESULT` kinds the coordinator's post-response side effects
/// (§4.3.4) and aggregation rule (§4.3.3) need to distinguish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultBody {
    Void,
    Rows,
    SetKeyspace { keyspace: String },
    Prepared { prepared_id: Bytes },
    SchemaChange,
}

/// A decoded CQL message. Variants carry just enough structure for the
/// coordinator's decisions; body bytes not named here are not retained.
#[derive(Debug, Clone)]
pub enum Message {
    Startup,
    Authenticate { authenticator_class: String },
    AuthResponse { token: Bytes },
    AuthSuccess,
    Ready,
    Register,
    Query { cql: String },
    Prepare { cql: String },
    Execute { prepared_id: Bytes },
    Batch { intent: Intent },
    Options,
    Result(ResultBody),
    Error { code: ErrorCode, message: String },
    Event { kind: EventKind },
    /// Anything else: forwarded, never decoded further.
    Opaque,
}

impl Message {
    /// Classifies a request message into read/write/keyspace-setting intent,
    /// per spec §4.3.2. Returns `None` for opcodes that are not request
    /// opcodes subject to intent classification (`Query`/`Prepare`/`Execute`/
    /// `Batch`).
    pub fn intent(&self) -> Option<Intent> {
        match self {
            Message::Query { cql } | Message::Prepare { cql } => Some(classify_cql(cql)),
            Message::Batch { intent } => Some(*intent),
            _ => None,
        }
    }
}

/// Classifies a CQL statement's leading keyword into read/write/keyspace
/// intent. Case-insensitive; leading whitespace is skipped.
pub fn classify_cql(cql: &str) -> Intent {
    let trimmed = cql.trim_start();
    let first_word: String = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    match first_word.as_str() {
        "SELECT" => Intent::Read,
        "USE" => Intent::SetKeyspace,
        // INSERT / UPDATE / DELETE / BATCH / everything else mutating.
        _ => Intent::Write,
    }
}
