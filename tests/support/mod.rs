//! Shared scaffolding for end-to-end scenario tests: a scriptable mock
//! upstream cluster plus CQL frame builders matching the exact wire shapes
//! `WireCodec` understands.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use cqlproxy::protocol::{CqlFrameCodec, FrameHeader, OpCode, RawFrame};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

/// Records every opcode a mock cluster received, in order, so tests can
/// assert a request never reached an upstream it shouldn't have.
pub type ReceivedLog = Arc<Mutex<Vec<(i16, OpCode)>>>;

/// Starts a one-shot mock upstream: accepts a single connection, then for
/// each inbound frame calls `handle` and writes back whatever frames it
/// returns (zero, one, or more). Logs every inbound frame's (stream_id,
/// opcode) to the returned log before invoking `handle`.
pub async fn spawn_mock_cluster<F>(handle: F) -> (SocketAddr, ReceivedLog)
where
    F: Fn(&RawFrame) -> Vec<RawFrame> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock cluster");
    let addr = listener.local_addr().expect("mock cluster local addr");
    let log: ReceivedLog = Arc::new(Mutex::new(Vec::new()));
    let task_log = Arc::clone(&log);

    tokio::spawn(async move {
        let (socket, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        let mut framed = Framed::new(socket, CqlFrameCodec::default());
        while let Some(Ok(frame)) = framed.next().await {
            task_log
                .lock()
                .expect("mock cluster log mutex poisoned")
                .push((frame.stream_id(), frame.opcode()));
            for response in handle(&frame) {
                if framed.send(response).await.is_err() {
                    return;
                }
            }
        }
    });

    (addr, log)
}

pub fn frame(stream_id: i16, version: u8, opcode: OpCode, body: Bytes) -> RawFrame {
    RawFrame::new(
        FrameHeader {
            version,
            flags: 0,
            stream_id,
            opcode,
            body_length: body.len() as u32,
        },
        body,
    )
}

fn short_string(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

pub fn startup_frame(stream_id: i16, version: u8) -> RawFrame {
    frame(stream_id, version, OpCode::Startup, Bytes::new())
}

pub fn ready_frame(stream_id: i16, version: u8) -> RawFrame {
    frame(stream_id, version | 0x80, OpCode::Ready, Bytes::new())
}

pub fn authenticate_frame(stream_id: i16, version: u8, authenticator_class: &str) -> RawFrame {
    let mut body = BytesMut::new();
    short_string(&mut body, authenticator_class);
    frame(stream_id, version | 0x80, OpCode::Authenticate, body.freeze())
}

pub fn auth_response_frame(stream_id: i16, version: u8, token: &[u8]) -> RawFrame {
    let mut body = BytesMut::new();
    body.put_u16(token.len() as u16);
    body.put_slice(token);
    frame(stream_id, version, OpCode::AuthResponse, body.freeze())
}

pub fn auth_success_frame(stream_id: i16, version: u8) -> RawFrame {
    frame(stream_id, version | 0x80, OpCode::AuthSuccess, Bytes::new())
}

pub fn query_frame(stream_id: i16, version: u8, cql: &str) -> RawFrame {
    let mut body = BytesMut::new();
    body.put_u32(cql.len() as u32);
    body.put_slice(cql.as_bytes());
    frame(stream_id, version, OpCode::Query, body.freeze())
}

pub fn execute_frame(stream_id: i16, version: u8, prepared_id: &[u8]) -> RawFrame {
    let mut body = BytesMut::new();
    body.put_u16(prepared_id.len() as u16);
    body.put_slice(prepared_id);
    frame(stream_id, version, OpCode::Execute, body.freeze())
}

/// A server-initiated event frame on the reserved stream id, carrying only
/// the event type string `WireCodec::decode_event` needs.
pub fn event_frame(kind: &str) -> RawFrame {
    let mut body = BytesMut::new();
    short_string(&mut body, kind);
    frame(-1, 4, OpCode::Event, body.freeze())
}

pub fn result_void_frame(stream_id: i16, version: u8) -> RawFrame {
    let mut body = BytesMut::new();
    body.put_u32(0x0001);
    frame(stream_id, version | 0x80, OpCode::Result, body.freeze())
}

pub fn result_rows_frame(stream_id: i16, version: u8) -> RawFrame {
    let mut body = BytesMut::new();
    body.put_u32(0x0002);
    frame(stream_id, version | 0x80, OpCode::Result, body.freeze())
}

pub fn error_frame(stream_id: i16, version: u8, code: u32, message: &str) -> RawFrame {
    let mut body = BytesMut::new();
    body.put_u32(code);
    short_string(&mut body, message);
    frame(stream_id, version | 0x80, OpCode::Error, body.freeze())
}

/// Standard Origin-side handshake script: `STARTUP` → `READY`, anything
/// registered on the reserved internal stream id also gets a `READY` so the
/// connector's `forward` oneshot resolves.
pub fn ready_on_startup_and_register(req: &RawFrame) -> Vec<RawFrame> {
    match req.opcode() {
        OpCode::Startup => vec![ready_frame(req.stream_id(), req.version())],
        OpCode::Register => vec![ready_frame(req.stream_id(), req.version())],
        _ => vec![],
    }
}
