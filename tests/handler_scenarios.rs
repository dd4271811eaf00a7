//! End-to-end scenario tests driving a real `ClientHandler` over loopback
//! TCP against scripted mock Origin/Target clusters: a clean handshake, an
//! authenticated handshake that drives Target's own auth, read/write
//! routing, dual-write divergence, unprepared-execute synthesis,
//! prepare-then-execute cache routing, and event multiplexing.

mod support;

use std::sync::Arc;
use std::time::Duration;

use cqlproxy::cache::PreparedStatementCache;
use cqlproxy::handler::{ClientHandler, TargetCredentials};
use cqlproxy::metrics::{AtomicMetrics, MetricsHandler, Series};
use cqlproxy::protocol::{Codec, CqlFrameCodec, EventKind, Message, OpCode, WireCodec};
use cqlproxy::shutdown::Shutdown;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing_test::logs_contain;

use support::*;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    driver: Framed<TcpStream, CqlFrameCodec>,
    origin_log: ReceivedLog,
    target_log: ReceivedLog,
    metrics: Arc<AtomicMetrics>,
    cache: Arc<PreparedStatementCache>,
}

async fn start_proxy<O, T>(origin_handle: O, target_handle: T) -> Harness
where
    O: Fn(&cqlproxy::protocol::RawFrame) -> Vec<cqlproxy::protocol::RawFrame> + Send + Sync + 'static,
    T: Fn(&cqlproxy::protocol::RawFrame) -> Vec<cqlproxy::protocol::RawFrame> + Send + Sync + 'static,
{
    let (origin_addr, origin_log) = spawn_mock_cluster(origin_handle).await;
    let (target_addr, target_log) = spawn_mock_cluster(target_handle).await;

    let client_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind client listener");
    let client_addr = client_listener.local_addr().expect("client listener addr");

    let driver_socket = TcpStream::connect(client_addr).await.expect("connect driver");
    let (client_socket, _) = client_listener.accept().await.expect("accept driver");

    let origin_socket = TcpStream::connect(origin_addr).await.expect("connect origin");
    let target_socket = TcpStream::connect(target_addr).await.expect("connect target");

    let codec: Arc<dyn Codec> = Arc::new(WireCodec);
    let cache = Arc::new(PreparedStatementCache::new(10));
    let metrics = Arc::new(AtomicMetrics::new());
    let metrics_handle: Arc<dyn MetricsHandler> = metrics.clone();

    let handler = ClientHandler::new(
        client_socket,
        origin_socket,
        target_socket,
        codec,
        Arc::clone(&cache),
        metrics_handle,
        TargetCredentials {
            username: Some("proxy_user".to_owned()),
            password: Some("proxy_pass".to_owned()),
        },
        Shutdown::new(),
    );
    tokio::spawn(handler.run());

    let driver = Framed::new(driver_socket, CqlFrameCodec::default());
    Harness {
        driver,
        origin_log,
        target_log,
        metrics,
        cache,
    }
}

async fn recv(driver: &mut Framed<TcpStream, CqlFrameCodec>) -> cqlproxy::protocol::RawFrame {
    timeout(TIMEOUT, driver.next())
        .await
        .expect("timed out waiting for response")
        .expect("connection closed")
        .expect("frame decode error")
}

/// Collects whatever frames arrive on `driver` within `idle` of each other,
/// stopping at the first gap. Used where a scenario's frame count depends on
/// a filter under test (events) rather than being fixed in advance.
async fn drain_available(
    driver: &mut Framed<TcpStream, CqlFrameCodec>,
    idle: Duration,
) -> Vec<cqlproxy::protocol::RawFrame> {
    let mut frames = Vec::new();
    while let Ok(Some(Ok(frame))) = timeout(idle, driver.next()).await {
        frames.push(frame);
    }
    frames
}

async fn run_handshake(driver: &mut Framed<TcpStream, CqlFrameCodec>) {
    driver
        .send(startup_frame(0, 4))
        .await
        .expect("send startup");
    let reply = recv(driver).await;
    assert_eq!(reply.stream_id(), 0);
    assert_eq!(reply.opcode(), OpCode::Ready);
}

#[tokio::test]
async fn s1_clean_handshake_reaches_ready() {
    let mut harness = start_proxy(ready_on_startup_and_register, ready_on_startup_and_register).await;
    run_handshake(&mut harness.driver).await;

    // Target's handshake (STARTUP) and the auto-register both happened
    // before the client ever saw READY.
    let target_ops: Vec<OpCode> = harness
        .target_log
        .lock()
        .unwrap()
        .iter()
        .map(|(_, op)| *op)
        .collect();
    assert!(target_ops.contains(&OpCode::Startup));
    assert!(target_ops.contains(&OpCode::Register));
}

#[tokio::test]
async fn s2_authenticated_handshake_drives_target_auth() {
    let origin_handle = |req: &cqlproxy::protocol::RawFrame| -> Vec<cqlproxy::protocol::RawFrame> {
        match req.opcode() {
            OpCode::Startup => vec![authenticate_frame(req.stream_id(), req.version(), "PasswordAuthenticator")],
            OpCode::AuthResponse => vec![auth_success_frame(req.stream_id(), req.version())],
            _ => vec![],
        }
    };
    let target_handle = |req: &cqlproxy::protocol::RawFrame| -> Vec<cqlproxy::protocol::RawFrame> {
        match req.opcode() {
            OpCode::Startup => vec![authenticate_frame(req.stream_id(), req.version(), "PasswordAuthenticator")],
            OpCode::AuthResponse => vec![auth_success_frame(req.stream_id(), req.version())],
            OpCode::Register => vec![auth_success_frame(req.stream_id(), req.version())],
            _ => vec![],
        }
    };
    let mut harness = start_proxy(origin_handle, target_handle).await;

    harness
        .driver
        .send(startup_frame(0, 4))
        .await
        .expect("send startup");
    let auth_prompt = recv(&mut harness.driver).await;
    assert_eq!(auth_prompt.opcode(), OpCode::Authenticate);

    harness
        .driver
        .send(auth_response_frame(0, 4, b"\0user\0pass"))
        .await
        .expect("send auth response");
    let reply = recv(&mut harness.driver).await;
    assert_eq!(reply.opcode(), OpCode::AuthSuccess);
    assert_eq!(reply.stream_id(), 0);
}

#[tokio::test]
async fn s3_read_goes_to_origin_only() {
    let origin_handle = |req: &cqlproxy::protocol::RawFrame| -> Vec<cqlproxy::protocol::RawFrame> {
        match req.opcode() {
            OpCode::Startup => vec![ready_frame(req.stream_id(), req.version())],
            OpCode::Query => vec![result_rows_frame(req.stream_id(), req.version())],
            _ => vec![],
        }
    };
    let mut harness = start_proxy(origin_handle, ready_on_startup_and_register).await;
    run_handshake(&mut harness.driver).await;

    harness
        .driver
        .send(query_frame(7, 4, "SELECT * FROM t"))
        .await
        .expect("send query");
    let reply = recv(&mut harness.driver).await;
    assert_eq!(reply.stream_id(), 7);
    assert_eq!(reply.opcode(), OpCode::Result);

    assert!(!harness
        .target_log
        .lock()
        .unwrap()
        .iter()
        .any(|(stream_id, op)| *stream_id == 7 && *op == OpCode::Query));
    assert_eq!(harness.metrics.count(Series::SuccessReads), 1);
}

#[tokio::test]
async fn register_and_options_are_not_metered_as_reads() {
    // REGISTER and OPTIONS both route to Origin only (inspector.rs), the
    // same decision as an actual SELECT, but neither is a read: the read
    // series must stay untouched by them.
    let origin_handle = |req: &cqlproxy::protocol::RawFrame| -> Vec<cqlproxy::protocol::RawFrame> {
        match req.opcode() {
            OpCode::Startup => vec![ready_frame(req.stream_id(), req.version())],
            OpCode::Register => vec![ready_frame(req.stream_id(), req.version())],
            OpCode::Options => vec![ready_frame(req.stream_id(), req.version())],
            _ => vec![],
        }
    };
    let mut harness = start_proxy(origin_handle, ready_on_startup_and_register).await;
    run_handshake(&mut harness.driver).await;

    harness
        .driver
        .send(support::frame(2, 4, OpCode::Register, bytes::Bytes::new()))
        .await
        .expect("send register");
    let register_ack = recv(&mut harness.driver).await;
    assert_eq!(register_ack.stream_id(), 2);

    harness
        .driver
        .send(support::frame(3, 4, OpCode::Options, bytes::Bytes::new()))
        .await
        .expect("send options");
    let options_ack = recv(&mut harness.driver).await;
    assert_eq!(options_ack.stream_id(), 3);

    assert_eq!(harness.metrics.count(Series::SuccessReads), 0);
    assert_eq!(harness.metrics.count(Series::FailedReads), 0);
    assert_eq!(harness.metrics.count(Series::InFlightReadRequests), 0);
}

#[tokio::test]
async fn s4_dual_write_success_returns_origin_response() {
    let write_handle = |req: &cqlproxy::protocol::RawFrame| -> Vec<cqlproxy::protocol::RawFrame> {
        match req.opcode() {
            OpCode::Startup => vec![ready_frame(req.stream_id(), req.version())],
            OpCode::Register => vec![ready_frame(req.stream_id(), req.version())],
            OpCode::Query => vec![result_void_frame(req.stream_id(), req.version())],
            _ => vec![],
        }
    };
    let mut harness = start_proxy(write_handle, write_handle).await;
    run_handshake(&mut harness.driver).await;

    harness
        .driver
        .send(query_frame(9, 4, "INSERT INTO t (a) VALUES (1)"))
        .await
        .expect("send insert");
    let reply = recv(&mut harness.driver).await;
    assert_eq!(reply.stream_id(), 9);
    assert_eq!(reply.opcode(), OpCode::Result);

    assert!(harness
        .origin_log
        .lock()
        .unwrap()
        .iter()
        .any(|(stream_id, op)| *stream_id == 9 && *op == OpCode::Query));
    assert!(harness
        .target_log
        .lock()
        .unwrap()
        .iter()
        .any(|(stream_id, op)| *stream_id == 9 && *op == OpCode::Query));
    assert_eq!(harness.metrics.count(Series::SuccessBothWrites), 1);
}

#[tokio::test]
async fn s5_dual_write_divergence_returns_failed_side() {
    let origin_handle = |req: &cqlproxy::protocol::RawFrame| -> Vec<cqlproxy::protocol::RawFrame> {
        match req.opcode() {
            OpCode::Startup => vec![ready_frame(req.stream_id(), req.version())],
            OpCode::Query => vec![result_void_frame(req.stream_id(), req.version())],
            _ => vec![],
        }
    };
    let target_handle = |req: &cqlproxy::protocol::RawFrame| -> Vec<cqlproxy::protocol::RawFrame> {
        match req.opcode() {
            OpCode::Startup => vec![ready_frame(req.stream_id(), req.version())],
            OpCode::Register => vec![ready_frame(req.stream_id(), req.version())],
            OpCode::Query => vec![error_frame(req.stream_id(), req.version(), 0x1100, "write timeout")],
            _ => vec![],
        }
    };
    let mut harness = start_proxy(origin_handle, target_handle).await;
    run_handshake(&mut harness.driver).await;

    harness
        .driver
        .send(query_frame(11, 4, "INSERT INTO t (a) VALUES (1)"))
        .await
        .expect("send insert");
    let reply = recv(&mut harness.driver).await;
    assert_eq!(reply.stream_id(), 11);
    assert_eq!(reply.opcode(), OpCode::Error);

    assert_eq!(harness.metrics.count(Series::FailedTargetOnlyWrites), 1);
    assert_eq!(harness.metrics.count(Series::WriteTimeoutsTargetCluster), 1);
}

#[tokio::test]
async fn s6_unprepared_execute_is_synthesized_without_touching_upstreams() {
    let mut harness = start_proxy(ready_on_startup_and_register, ready_on_startup_and_register).await;
    run_handshake(&mut harness.driver).await;

    let prepared_id = [0xABu8, 0xCD];
    harness
        .driver
        .send(execute_frame(3, 4, &prepared_id))
        .await
        .expect("send execute");
    let reply = recv(&mut harness.driver).await;
    assert_eq!(reply.stream_id(), 3);
    assert_eq!(reply.opcode(), OpCode::Error);

    let decoded_id = cqlproxy::protocol::decode_unprepared_id(&reply.body).expect("decode unprepared id");
    assert_eq!(decoded_id.as_ref(), &prepared_id[..]);

    assert!(!harness
        .origin_log
        .lock()
        .unwrap()
        .iter()
        .any(|(stream_id, op)| *stream_id == 3 && *op == OpCode::Execute));
    assert!(!harness
        .target_log
        .lock()
        .unwrap()
        .iter()
        .any(|(stream_id, op)| *stream_id == 3 && *op == OpCode::Execute));
    assert!(harness.cache.is_empty());
}

#[tokio::test]
#[tracing_test::traced_test]
async fn malformed_execute_logs_and_tears_down_connection() {
    let mut harness = start_proxy(ready_on_startup_and_register, ready_on_startup_and_register).await;
    run_handshake(&mut harness.driver).await;

    // An EXECUTE with a truncated prepared-id field fails to decode.
    harness
        .driver
        .send(support::frame(6, 4, OpCode::Execute, bytes::Bytes::new()))
        .await
        .expect("send malformed execute");

    assert!(timeout(TIMEOUT, harness.driver.next()).await.expect("timed out").is_none());
    assert!(logs_contain("could not classify request, dropping connection"));
}

#[tokio::test]
async fn prepare_then_execute_routes_via_cached_intent() {
    let origin_handle = |req: &cqlproxy::protocol::RawFrame| -> Vec<cqlproxy::protocol::RawFrame> {
        match req.opcode() {
            OpCode::Startup => vec![ready_frame(req.stream_id(), req.version())],
            OpCode::Prepare => {
                let mut body = bytes::BytesMut::new();
                body.extend_from_slice(&0x0004u32.to_be_bytes());
                body.extend_from_slice(&[0x00, 0x02, 0xAB, 0xCD]);
                vec![support::frame(
                    req.stream_id(),
                    req.version() | 0x80,
                    OpCode::Result,
                    body.freeze(),
                )]
            }
            OpCode::Execute => vec![result_rows_frame(req.stream_id(), req.version())],
            _ => vec![],
        }
    };
    let mut harness = start_proxy(origin_handle, ready_on_startup_and_register).await;
    run_handshake(&mut harness.driver).await;

    let mut prepare_body = bytes::BytesMut::new();
    prepare_body.extend_from_slice(&(b"SELECT * FROM t".len() as u32).to_be_bytes());
    prepare_body.extend_from_slice(b"SELECT * FROM t");
    harness
        .driver
        .send(support::frame(4, 4, OpCode::Prepare, prepare_body.freeze()))
        .await
        .expect("send prepare");
    let prepared_reply = recv(&mut harness.driver).await;
    assert_eq!(prepared_reply.opcode(), OpCode::Result);
    // The cache insert happens-before the response send, so by the time the
    // driver observes the reply the prepared id is already cached.
    assert!(!harness.cache.is_empty());

    harness
        .driver
        .send(execute_frame(5, 4, &[0xAB, 0xCD]))
        .await
        .expect("send execute");
    let executed_reply = recv(&mut harness.driver).await;
    assert_eq!(executed_reply.stream_id(), 5);
    assert_eq!(executed_reply.opcode(), OpCode::Result);

    assert!(harness
        .origin_log
        .lock()
        .unwrap()
        .iter()
        .any(|(stream_id, op)| *stream_id == 5 && *op == OpCode::Execute));
}

#[tokio::test]
async fn s7_event_multiplexing_filters_by_origin() {
    // Origin emits a qualifying SchemaChange plus a non-qualifying
    // StatusChange (wrong origin for that kind); Target emits qualifying
    // Status/TopologyChange plus a non-qualifying SchemaChange.
    let origin_handle = |req: &cqlproxy::protocol::RawFrame| -> Vec<cqlproxy::protocol::RawFrame> {
        match req.opcode() {
            OpCode::Startup => vec![ready_frame(req.stream_id(), req.version())],
            OpCode::Register => vec![
                ready_frame(req.stream_id(), req.version()),
                event_frame("SCHEMA_CHANGE"),
                event_frame("STATUS_CHANGE"),
            ],
            _ => vec![],
        }
    };
    let target_handle = |req: &cqlproxy::protocol::RawFrame| -> Vec<cqlproxy::protocol::RawFrame> {
        match req.opcode() {
            OpCode::Startup => vec![ready_frame(req.stream_id(), req.version())],
            OpCode::Register => vec![
                ready_frame(req.stream_id(), req.version()),
                event_frame("STATUS_CHANGE"),
                event_frame("TOPOLOGY_CHANGE"),
                event_frame("SCHEMA_CHANGE"),
            ],
            _ => vec![],
        }
    };
    let mut harness = start_proxy(origin_handle, target_handle).await;
    run_handshake(&mut harness.driver).await;

    // The client's own REGISTER routes to Origin only (inspector.rs), which
    // is what lets Origin's scripted events above flow in response to it,
    // alongside Target's events from its auto-register at handshake time.
    harness
        .driver
        .send(support::frame(1, 4, OpCode::Register, bytes::Bytes::new()))
        .await
        .expect("send register");

    let frames = drain_available(&mut harness.driver, Duration::from_millis(500)).await;

    let register_ack_count = frames.iter().filter(|f| f.stream_id() == 1).count();
    assert_eq!(register_ack_count, 1, "exactly one ack for the client's REGISTER");

    let event_kinds: Vec<EventKind> = frames
        .iter()
        .filter(|f| f.stream_id() == -1)
        .map(|f| match WireCodec.decode_body(&f.header, &f.body).expect("decode event") {
            Message::Event { kind } => kind,
            other => panic!("expected Event, got {other:?}"),
        })
        .collect();

    // Exactly the three qualifying events: Origin's SchemaChange and
    // Target's Status/TopologyChange. The cross-origin SchemaChange (from
    // Target) and StatusChange (from Origin) must not appear.
    assert_eq!(event_kinds.len(), 3);
    assert!(event_kinds.contains(&EventKind::SchemaChange));
    assert!(event_kinds.contains(&EventKind::StatusChange));
    assert!(event_kinds.contains(&EventKind::TopologyChange));
}
