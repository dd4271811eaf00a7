//! `RequestInspector` (spec §4.3.2): classifies each post-handshake request
//! frame into a [`ForwardDecision`], and owns the cache-miss detection for
//! `EXECUTE` against unknown prepared ids.

use bytes::Bytes;
use thiserror::Error;

use crate::cache::{PreparedEntry, PreparedStatementCache};
use crate::protocol::{Codec, CodecError, Intent, Message, OpCode, RawFrame};

/// Per-request routing outcome (spec §3, §4.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    Origin,
    Target,
    Both,
}

/// An `EXECUTE` whose prepared id the cache does not recognize. Not an
/// upstream error (spec §7): the coordinator synthesizes an `Unprepared`
/// response instead of touching either upstream.
#[derive(Debug, Clone)]
pub struct UnpreparedExecute {
    pub prepared_id: Bytes,
    pub stream_id: i16,
    pub version: u8,
}

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("unprepared execute")]
    Unprepared(UnpreparedExecute),
    #[error("could not decode request body: {0}")]
    Malformed(#[from] CodecError),
}

fn decision_for_intent(intent: Intent) -> ForwardDecision {
    match intent {
        Intent::Read => ForwardDecision::Origin,
        Intent::Write => ForwardDecision::Both,
        Intent::SetKeyspace => ForwardDecision::Both,
    }
}

/// The outcome of classifying a request frame: the routing decision plus,
/// for opcodes the coordinator needs to act on later (`Prepare` for the
/// cache insert in §4.3.4, `Execute` for its resolved prepared entry), the
/// message that was decoded to produce it. Decoded once, reused by the
/// coordinator instead of re-parsing the body.
pub struct Classified {
    pub decision: ForwardDecision,
    pub message: Option<Message>,
}

/// Classifies `frame` into a [`ForwardDecision`], per spec §4.3.2. Returns
/// `Ok` with the decision, or `Err(InspectError::Unprepared(..))` when the
/// frame is an `EXECUTE` whose prepared id is not in `cache` — the caller
/// must not forward the frame in that case.
pub fn inspect(
    frame: &RawFrame,
    codec: &dyn Codec,
    cache: &PreparedStatementCache,
) -> Result<Classified, InspectError> {
    match frame.opcode() {
        OpCode::Query | OpCode::Prepare => {
            let message = codec.decode_body(&frame.header, &frame.body)?;
            let intent = message
                .intent()
                .expect("Query/Prepare always yield an intent");
            Ok(Classified {
                decision: decision_for_intent(intent),
                message: Some(message),
            })
        }
        OpCode::Batch => {
            // Spec §4.3.2: a batch of statements is always a write.
            Ok(Classified {
                decision: ForwardDecision::Both,
                message: None,
            })
        }
        OpCode::Execute => {
            let message = codec.decode_body(&frame.header, &frame.body)?;
            let Message::Execute { ref prepared_id } = message else {
                unreachable!("decode_body(Execute) always yields Message::Execute");
            };
            match cache.lookup(prepared_id) {
                Some(PreparedEntry { intent, .. }) => Ok(Classified {
                    decision: decision_for_intent(intent),
                    message: Some(message),
                }),
                None => Err(InspectError::Unprepared(UnpreparedExecute {
                    prepared_id: prepared_id.clone(),
                    stream_id: frame.stream_id(),
                    version: frame.version(),
                })),
            }
        }
        OpCode::Register => Ok(Classified {
            decision: ForwardDecision::Origin,
            message: None,
        }),
        // Options and any other control opcode: Origin only (spec §4.3.2).
        _ => Ok(Classified {
            decision: ForwardDecision::Origin,
            message: None,
        }),
    }
}
