//! Wire-level framing: `RawFrame` is the opaque unit the rest of the proxy
//! forwards unmodified. Only the header is ever inspected on the hot path;
//! the body is touched solely by [`super::codec::Codec::decode_body`] when a
//! post-response side effect (§4.3.4) or a forwarding decision (§4.3.2)
//! requires it.

use bytes::Bytes;

/// Reserved stream id for server-initiated events (CQL native protocol).
pub const EVENT_STREAM_ID: i16 = -1;

/// CQL native protocol opcodes referenced by this proxy.
///
/// Not an exhaustive list of the protocol's opcodes: only the ones the
/// handshake state machine, the request inspector, or the event multiplexer
/// need to recognize by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Error,
    Startup,
    Ready,
    Authenticate,
    Options,
    Query,
    Result,
    Prepare,
    Execute,
    Register,
    Event,
    Batch,
    AuthChallenge,
    AuthResponse,
    AuthSuccess,
    /// Any opcode this proxy does not need to special-case; carried as-is.
    Other(u8),
}

impl OpCode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => OpCode::Error,
            0x01 => OpCode::Startup,
            0x02 => OpCode::Ready,
            0x03 => OpCode::Authenticate,
            0x05 => OpCode::Options,
            0x07 => OpCode::Query,
            0x08 => OpCode::Result,
            0x09 => OpCode::Prepare,
            0x0a => OpCode::Execute,
            0x0b => OpCode::Register,
            0x0c => OpCode::Event,
            0x0d => OpCode::Batch,
            0x0e => OpCode::AuthChallenge,
            0x0f => OpCode::AuthResponse,
            0x10 => OpCode::AuthSuccess,
            other => OpCode::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            OpCode::Error => 0x00,
            OpCode::Startup => 0x01,
            OpCode::Ready => 0x02,
            OpCode::Authenticate => 0x03,
            OpCode::Options => 0x05,
            OpCode::Query => 0x07,
            OpCode::Result => 0x08,
            OpCode::Prepare => 0x09,
            OpCode::Execute => 0x0a,
            OpCode::Register => 0x0b,
            OpCode::Event => 0x0c,
            OpCode::Batch => 0x0d,
            OpCode::AuthChallenge => 0x0e,
            OpCode::AuthResponse => 0x0f,
            OpCode::AuthSuccess => 0x10,
            OpCode::Other(b) => b,
        }
    }
}

/// The 9-byte CQL frame header (v3/v4): version, flags, stream id, opcode,
/// body length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub stream_id: i16,
    pub opcode: OpCode,
    pub body_length: u32,
}

impl FrameHeader {
    pub const LENGTH: usize = 9;

    /// The response-direction version byte: the client-facing version has
    /// its high bit set to mark the frame as a response.
    pub fn response_version(request_version: u8) -> u8 {
        request_version | 0x80
    }

    pub fn is_event(&self) -> bool {
        self.stream_id == EVENT_STREAM_ID
    }
}

/// An opaque framing unit: header plus body bytes. The proxy forwards these
/// verbatim between client and upstream except where the spec requires
/// inspection or synthesis.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl RawFrame {
    pub fn new(header: FrameHeader, body: Bytes) -> Self {
        Self { header, body }
    }

    pub fn stream_id(&self) -> i16 {
        self.header.stream_id
    }

    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    pub fn version(&self) -> u8 {
        self.header.version
    }
}
