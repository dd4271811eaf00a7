//! The CQL frame codec. [`Codec`] is the injected-collaborator trait that
//! decodes a frame's body into a typed [`Message`]; it is passed into every
//! `ClientHandler` rather than reached for as global state, so a test or an
//! alternate wire dialect can swap it out. [`WireCodec`] is a concrete,
//! dependency-free implementation sufficient for the message kinds this
//! proxy inspects. Frames the proxy itself synthesizes (a driven-handshake
//! auth response, the internal register, a synthesized `Unprepared` error)
//! are built by the free functions below instead, since they never need to
//! round-trip through a decode step.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::frame::{FrameHeader, OpCode, RawFrame};
use super::message::{ErrorCode, EventKind, Message, ResultBody};

/// Errors from decoding a frame body. Malformed bodies are recoverable when
/// decoding is advisory (post-response inspection): callers treat a decode
/// failure as "forward the raw frame unexamined" rather than tearing down
/// the connection.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame body truncated while reading {0}")]
    Truncated(&'static str),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("unrecognized result kind {0:#06x}")]
    UnknownResultKind(u32),
    #[error("unrecognized event kind {0:?}")]
    UnknownEventKind(String),
}

/// Injected collaborator: decodes a typed [`Message`] from a frame's header
/// and body.
pub trait Codec: Send + Sync + 'static {
    fn decode_body(&self, header: &FrameHeader, body: &[u8]) -> Result<Message, CodecError>;
}

/// The default, dependency-free [`Codec`].
#[derive(Debug, Default, Clone, Copy)]
pub struct WireCodec;

fn read_short_string(buf: &mut &[u8], what: &'static str) -> Result<String, CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::Truncated(what));
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    buf.advance(2);
    if buf.len() < len {
        return Err(CodecError::Truncated(what));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| CodecError::InvalidUtf8(what))?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

fn read_long_string(buf: &mut &[u8], what: &'static str) -> Result<String, CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::Truncated(what));
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    buf.advance(4);
    if buf.len() < len {
        return Err(CodecError::Truncated(what));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| CodecError::InvalidUtf8(what))?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

fn read_short_bytes(buf: &mut &[u8], what: &'static str) -> Result<Bytes, CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::Truncated(what));
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    buf.advance(2);
    if buf.len() < len {
        return Err(CodecError::Truncated(what));
    }
    let b = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(b)
}

fn write_short_string(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

fn write_short_bytes(out: &mut BytesMut, b: &[u8]) {
    out.put_u16(b.len() as u16);
    out.put_slice(b);
}

impl Codec for WireCodec {
    fn decode_body(&self, header: &FrameHeader, body: &[u8]) -> Result<Message, CodecError> {
        let mut buf = body;
        match header.opcode {
            OpCode::Startup => Ok(Message::Startup),
            OpCode::Ready => Ok(Message::Ready),
            OpCode::AuthSuccess => Ok(Message::AuthSuccess),
            OpCode::Register => Ok(Message::Register),
            OpCode::Options => Ok(Message::Options),
            OpCode::Authenticate => {
                let class = read_short_string(&mut buf, "authenticator class")?;
                Ok(Message::Authenticate {
                    authenticator_class: class,
                })
            }
            OpCode::AuthResponse => {
                let token = read_short_bytes(&mut buf, "auth token")?;
                Ok(Message::AuthResponse { token })
            }
            OpCode::Query => {
                let cql = read_long_string(&mut buf, "query string")?;
                Ok(Message::Query { cql })
            }
            OpCode::Prepare => {
                let cql = read_long_string(&mut buf, "prepare query string")?;
                Ok(Message::Prepare { cql })
            }
            OpCode::Execute => {
                let prepared_id = read_short_bytes(&mut buf, "prepared id")?;
                Ok(Message::Execute { prepared_id })
            }
            OpCode::Batch => {
                // Batches mix several statements; any batch is treated as
                // a write for forwarding purposes.
                Ok(Message::Batch {
                    intent: super::message::Intent::Write,
                })
            }
            OpCode::Result => decode_result(&mut buf),
            OpCode::Error => decode_error(&mut buf),
            OpCode::Event => decode_event(&mut buf),
            OpCode::AuthChallenge => Ok(Message::Opaque),
            OpCode::Other(_) => Ok(Message::Opaque),
        }
    }
}

/// Builds the internal `REGISTER` frame the coordinator sends to Target
/// right after its handshake succeeds, for the full event set. `stream_id`
/// should be an id reserved for internal use, never one a client request
/// uses.
pub fn encode_register_all_events(version: u8, stream_id: i16) -> RawFrame {
    const EVENT_TYPES: [&str; 3] = ["SCHEMA_CHANGE", "STATUS_CHANGE", "TOPOLOGY_CHANGE"];
    let mut body = BytesMut::new();
    body.put_u16(EVENT_TYPES.len() as u16);
    for event_type in EVENT_TYPES {
        write_short_string(&mut body, event_type);
    }
    let header = FrameHeader {
        version,
        flags: 0,
        stream_id,
        opcode: OpCode::Register,
        body_length: body.len() as u32,
    };
    RawFrame::new(header, body.freeze())
}

/// Builds the `AUTH_RESPONSE` frame carrying SASL PLAIN credentials
/// (`\0username\0password`), used only to authenticate Target — never
/// forwarded from the client.
pub fn encode_sasl_plain_auth_response(
    version: u8,
    stream_id: i16,
    username: &str,
    password: &str,
) -> RawFrame {
    let mut token = BytesMut::new();
    token.put_u8(0);
    token.put_slice(username.as_bytes());
    token.put_u8(0);
    token.put_slice(password.as_bytes());

    let mut body = BytesMut::new();
    write_short_bytes(&mut body, &token);

    let header = FrameHeader {
        version,
        flags: 0,
        stream_id,
        opcode: OpCode::AuthResponse,
        body_length: body.len() as u32,
    };
    RawFrame::new(header, body.freeze())
}

/// Encodes the synthesized `Unprepared` error body: code, message, and the
/// offending prepared id as short bytes, matching the exact wire shape a
/// CQL driver expects so it can transparently re-prepare.
pub fn encode_unprepared_body(prepared_id: &[u8]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(ErrorCode::Unprepared.to_u32());
    write_short_string(&mut body, "Unprepared statement");
    write_short_bytes(&mut body, prepared_id);
    body.freeze()
}

/// Builds the full synthesized `Unprepared` error frame returned to the
/// client for an `EXECUTE` whose prepared id missed the cache: same stream
/// id and protocol version as the originating `EXECUTE`.
pub fn encode_unprepared_frame(version: u8, stream_id: i16, prepared_id: &[u8]) -> RawFrame {
    let body = encode_unprepared_body(prepared_id);
    let header = FrameHeader {
        version: FrameHeader::response_version(version),
        flags: 0,
        stream_id,
        opcode: OpCode::Error,
        body_length: body.len() as u32,
    };
    RawFrame::new(header, body)
}

/// Decodes the trailing short-bytes field of a previously-synthesized
/// `Unprepared` error body back into the prepared id, for round-trip tests.
pub fn decode_unprepared_id(body: &[u8]) -> Result<Bytes, CodecError> {
    let mut buf = body;
    if buf.len() < 4 {
        return Err(CodecError::Truncated("unprepared error code"));
    }
    buf.advance(4);
    let _message = read_short_string(&mut buf, "unprepared message")?;
    read_short_bytes(&mut buf, "unprepared prepared id")
}

fn decode_result(buf: &mut &[u8]) -> Result<Message, CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::Truncated("result kind"));
    }
    let kind = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    buf.advance(4);
    let body = match kind {
        0x0001 => ResultBody::Void,
        0x0002 => ResultBody::Rows,
        0x0003 => {
            let keyspace = read_short_string(buf, "set keyspace name")?;
            ResultBody::SetKeyspace { keyspace }
        }
        0x0004 => {
            let prepared_id = read_short_bytes(buf, "prepared id")?;
            ResultBody::Prepared { prepared_id }
        }
        0x0005 => ResultBody::SchemaChange,
        other => return Err(CodecError::UnknownResultKind(other)),
    };
    Ok(Message::Result(body))
}

fn decode_error(buf: &mut &[u8]) -> Result<Message, CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::Truncated("error code"));
    }
    let code = ErrorCode::from_u32(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
    buf.advance(4);
    let message = read_short_string(buf, "error message")?;
    Ok(Message::Error { code, message })
}

fn decode_event(buf: &mut &[u8]) -> Result<Message, CodecError> {
    let kind_str = read_short_string(buf, "event type")?;
    let kind = match kind_str.as_str() {
        "SCHEMA_CHANGE" => EventKind::SchemaChange,
        "STATUS_CHANGE" => EventKind::StatusChange,
        "TOPOLOGY_CHANGE" => EventKind::TopologyChange,
        _ => return Err(CodecError::UnknownEventKind(kind_str)),
    };
    Ok(Message::Event { kind })
}
