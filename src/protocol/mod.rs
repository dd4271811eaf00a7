//! The CQL wire data model (§3, §6). Kept deliberately narrow: the proxy's
//! job is to forward bytes, not to fully understand them, so only the
//! message shapes the coordinator actually inspects are decoded.

mod codec;
mod frame;
mod io;
mod message;

pub use codec::{
    decode_unprepared_id, encode_register_all_events, encode_sasl_plain_auth_response,
    encode_unprepared_body, encode_unprepared_frame, Codec, CodecError, WireCodec,
};
pub use frame::{FrameHeader, OpCode, RawFrame, EVENT_STREAM_ID};
pub use io::{CqlFrameCodec, FrameIoError};
pub use message::{classify_cql, ErrorCode, EventKind, Intent, Message, ResultBody};
