//! Wire framing for [`tokio_util::codec::Framed`]: reads/writes the raw
//! `{header, body}` unit without ever looking at the body's contents. This
//! is the "framed I/O" §4.1/§4.2 build on top of.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{FrameHeader, OpCode, RawFrame};

/// Maximum accepted body length, guarding against a malformed or hostile
/// peer claiming an unbounded frame size.
const MAX_BODY_LENGTH: u32 = 256 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameIoError {
    #[error("declared body length {0} exceeds maximum {MAX_BODY_LENGTH}")]
    BodyTooLarge(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A [`Decoder`]/[`Encoder`] pair for [`RawFrame`] over a raw byte stream.
#[derive(Debug, Default)]
pub struct CqlFrameCodec {
    header: Option<FrameHeader>,
}

impl Decoder for CqlFrameCodec {
    type Item = RawFrame;
    type Error = FrameIoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.header.is_none() {
            if src.len() < FrameHeader::LENGTH {
                src.reserve(FrameHeader::LENGTH - src.len());
                return Ok(None);
            }
            let version = src[0];
            let flags = src[1];
            let stream_id = i16::from_be_bytes([src[2], src[3]]);
            let opcode = OpCode::from_byte(src[4]);
            let body_length = u32::from_be_bytes([src[5], src[6], src[7], src[8]]);
            if body_length > MAX_BODY_LENGTH {
                return Err(FrameIoError::BodyTooLarge(body_length));
            }
            src.advance(FrameHeader::LENGTH);
            self.header = Some(FrameHeader {
                version,
                flags,
                stream_id,
                opcode,
                body_length,
            });
        }

        let header = self.header.expect("checked above");
        let needed = header.body_length as usize;
        if src.len() < needed {
            src.reserve(needed - src.len());
            return Ok(None);
        }

        let body = src.split_to(needed).freeze();
        self.header = None;
        Ok(Some(RawFrame::new(header, body)))
    }
}

impl Encoder<RawFrame> for CqlFrameCodec {
    type Error = FrameIoError;

    fn encode(&mut self, frame: RawFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(FrameHeader::LENGTH + frame.body.len());
        dst.put_u8(frame.header.version);
        dst.put_u8(frame.header.flags);
        dst.put_i16(frame.header.stream_id);
        dst.put_u8(frame.header.opcode.to_byte());
        dst.put_u32(frame.header.body_length);
        dst.put_slice(&frame.body);
        Ok(())
    }
}
