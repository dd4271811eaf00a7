//! Crate-wide error taxonomy (spec §7). Per-request errors are logged at
//! `warn` and do not terminate the connection; connection-state errors
//! propagate to cancellation. Callers, not this enum, decide which bucket a
//! given error falls into — see [`ProxyError::is_connection_fatal`].

use thiserror::Error;

use crate::protocol::CodecError;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors raised anywhere in a `ClientHandler`'s lifetime.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A frame body could not be decoded. Non-fatal when decoding was
    /// advisory (e.g. inspecting a response already sent verbatim);
    /// callers that needed the decoded value to proceed treat it as fatal.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O failure talking to the client or an upstream.
    #[error("{peer} connection error: {source}")]
    Io {
        peer: Peer,
        #[source]
        source: std::io::Error,
    },

    /// The upstream closed the response channel before completing the
    /// request (§4.2 invariant: pending oneshots are closed, not completed,
    /// on shutdown).
    #[error("{0} connection closed while awaiting response")]
    UpstreamClosed(Peer),

    /// Handshake reached an opcode the state machine does not accept in its
    /// current state (§4.3.1, §7 "Protocol state").
    #[error("unexpected {peer} handshake reply: {detail}")]
    HandshakeProtocol { peer: Peer, detail: String },

    /// A non-handshake request arrived from the client before the handshake
    /// gate opened (spec §9, second Open Question: treated as a protocol
    /// violation, not reordered).
    #[error("client pipelined a request before the handshake completed")]
    PipelinedBeforeReady,

    /// The client's very first frame was not `STARTUP`.
    #[error("first client frame was not STARTUP")]
    MissingStartup,

    /// The connection is tearing down because of a shutdown signal, not an
    /// error; kept distinct so shutdown logs at `info`, not `warn` (§7).
    #[error("connection shutting down")]
    Shutdown,
}

/// Which side of the proxy an I/O or protocol error originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Client,
    Origin,
    Target,
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Peer::Client => "client",
            Peer::Origin => "origin",
            Peer::Target => "target",
        };
        f.write_str(s)
    }
}

impl ProxyError {
    /// Whether this error should terminate the whole connection (§7
    /// propagation policy) as opposed to being logged and the request
    /// failed in isolation.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, ProxyError::Codec(_))
    }
}
