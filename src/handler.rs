//! `ClientHandler`: the per-connection coordinator. Owns the handshake
//! state machine, the request inspector's forwarding decisions, concurrent
//! dual-dispatch with response aggregation, prepared-statement cache
//! coordination, and event-stream de-duplication between Origin and
//! Target.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::cache::{PreparedEntry, PreparedStatementCache};
use crate::client::ClientConnector;
use crate::cluster::ClusterConnector;
use crate::error::{Peer, ProxyError};
use crate::inspector::{self, Classified, ForwardDecision, InspectError};
use crate::metrics::{MetricsHandler, Series};
use crate::protocol::{
    self, Codec, Message, OpCode, RawFrame, ResultBody,
};
use crate::shutdown::Shutdown;

/// Internal stream id the coordinator uses to auto-register Target for the
/// full event set right after its handshake succeeds. Never used for a
/// client-originated request, since client stream ids are driver-assigned
/// non-negative values and -1 is already reserved for events.
const TARGET_AUTOREGISTER_STREAM_ID: i16 = -2;

struct Shared {
    origin: Arc<ClusterConnector>,
    target: Arc<ClusterConnector>,
    codec: Arc<dyn Codec>,
    cache: Arc<PreparedStatementCache>,
    metrics: Arc<dyn MetricsHandler>,
    current_keyspace: Arc<ArcSwapOption<String>>,
    response_outbox: mpsc::Sender<RawFrame>,
    shutdown: Shutdown,
}

impl Clone for Shared {
    fn clone(&self) -> Self {
        Self {
            origin: Arc::clone(&self.origin),
            target: Arc::clone(&self.target),
            codec: Arc::clone(&self.codec),
            cache: Arc::clone(&self.cache),
            metrics: Arc::clone(&self.metrics),
            current_keyspace: Arc::clone(&self.current_keyspace),
            response_outbox: self.response_outbox.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Credentials injected from configuration, used only to authenticate
/// Target; never forwarded from the client.
#[derive(Clone, Default)]
pub struct TargetCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

pub struct ClientHandler {
    client: ClientConnector,
    shared: Shared,
    origin_events: mpsc::Receiver<RawFrame>,
    target_events: mpsc::Receiver<RawFrame>,
    target_credentials: TargetCredentials,
    /// Captured from the client's first frame so it can be replayed to
    /// Target when it is time to authenticate Target.
    startup_frame: Option<RawFrame>,
    /// Mirrors the process-wide shutdown signal into this connection's own
    /// `Shutdown`, without letting this connection's own teardown (client
    /// EOF, upstream failure) propagate back up to its siblings.
    shutdown_link: JoinHandle<()>,
}

impl ClientHandler {
    /// `parent_shutdown` is the process-wide signal the server module
    /// triggers on `SIGINT`/`SIGTERM`; every accepted connection links its
    /// own `Shutdown` to it so a termination signal tears down in-flight
    /// connections instead of only stopping the accept loop.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_socket: TcpStream,
        origin_socket: TcpStream,
        target_socket: TcpStream,
        codec: Arc<dyn Codec>,
        cache: Arc<PreparedStatementCache>,
        metrics: Arc<dyn MetricsHandler>,
        target_credentials: TargetCredentials,
        parent_shutdown: Shutdown,
    ) -> Self {
        let shutdown = Shutdown::new();
        let shutdown_link = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                parent_shutdown.cancelled().await;
                shutdown.trigger();
            }
        });
        let client = ClientConnector::spawn(client_socket, shutdown.clone());
        let (origin, origin_events) =
            ClusterConnector::spawn(Peer::Origin, origin_socket, shutdown.clone());
        let (target, target_events) =
            ClusterConnector::spawn(Peer::Target, target_socket, shutdown.clone());

        let response_outbox = client.response_outbox.clone();
        let shared = Shared {
            origin: Arc::new(origin),
            target: Arc::new(target),
            codec,
            cache,
            metrics,
            current_keyspace: Arc::new(ArcSwapOption::from(None)),
            response_outbox,
            shutdown,
        };

        Self {
            client,
            shared,
            origin_events,
            target_events,
            target_credentials,
            startup_frame: None,
            shutdown_link,
        }
    }

    /// Drives the connection to completion: handshake, then the request
    /// loop and event merger concurrently, until client EOF, an upstream
    /// failure, or shutdown.
    pub async fn run(mut self) {
        if let Err(err) = self.run_handshake().await {
            self.log_teardown(&err, "handshake");
            self.teardown();
            return;
        }

        let event_merger = tokio::spawn(run_event_merger(
            self.origin_events,
            self.target_events,
            self.shared.response_outbox.clone(),
            self.shared.shutdown.clone(),
            Arc::clone(&self.shared.codec),
        ));

        self.run_request_loop().await;

        self.shared.shutdown.trigger();
        event_merger.abort();
        self.teardown();
    }

    fn teardown(&self) {
        self.client.abort();
        self.shared.origin.abort();
        self.shared.target.abort();
        self.shutdown_link.abort();
    }

    fn log_teardown(&self, err: &ProxyError, stage: &'static str) {
        if matches!(err, ProxyError::Shutdown) {
            info!(stage, "connection shutting down");
        } else {
            warn!(stage, error = %err, "tearing down connection");
        }
    }

    // ---- Handshake state machine ---------------------------------------

    /// Drives `Init → AwaitOriginStartup → AwaitOriginAuth* → OriginReady ∧
    /// AwaitTarget → Ready | Failed`. No other client request is dispatched
    /// until this returns `Ok`.
    #[instrument(skip(self), level = "debug")]
    async fn run_handshake(&mut self) -> Result<(), ProxyError> {
        let startup = self.recv_client_frame().await?;
        if !matches!(startup.opcode(), OpCode::Startup) {
            return Err(ProxyError::MissingStartup);
        }
        self.startup_frame = Some(startup.clone());

        let origin_reply = self.exchange_with(Peer::Origin, startup.clone()).await?;
        let origin_message = self.decode(&origin_reply)?;

        let origin_success_frame = match origin_message {
            Message::Ready | Message::AuthSuccess => origin_reply,
            Message::Authenticate { .. } => self.drive_origin_auth(origin_reply).await?,
            other => {
                return Err(ProxyError::HandshakeProtocol {
                    peer: Peer::Origin,
                    detail: format!("{other:?}"),
                })
            }
        };

        // Ordering rule: Target's handshake must complete, synchronously
        // from the request loop's point of view, before `Ready` holds.
        self.drive_target_handshake().await?;
        self.auto_register_target_events().await?;
        self.reject_if_pipelined()?;

        self.send_to_client(origin_success_frame).await;
        Ok(())
    }

    /// A client that sent a non-handshake frame before observing `Ready` is
    /// a protocol violation, not something to queue and dispatch once the
    /// gate opens. The reader task keeps pulling frames off the socket
    /// independently of handshake state, so by the time the gate is about
    /// to open, any frame already sitting in the inbox was necessarily
    /// sent early.
    fn reject_if_pipelined(&mut self) -> Result<(), ProxyError> {
        match self.client.request_inbox.try_recv() {
            Ok(_pipelined) => Err(ProxyError::PipelinedBeforeReady),
            Err(_) => Ok(()),
        }
    }

    async fn drive_origin_auth(&mut self, authenticate_challenge: RawFrame) -> Result<RawFrame, ProxyError> {
        self.send_to_client(authenticate_challenge).await;
        let auth_response = self.recv_client_frame().await?;
        if !matches!(auth_response.opcode(), OpCode::AuthResponse) {
            return Err(ProxyError::HandshakeProtocol {
                peer: Peer::Origin,
                detail: "expected AUTH_RESPONSE from client".to_owned(),
            });
        }
        let reply = self.exchange_with(Peer::Origin, auth_response).await?;
        match self.decode(&reply)? {
            Message::AuthSuccess => Ok(reply),
            other => Err(ProxyError::HandshakeProtocol {
                peer: Peer::Origin,
                detail: format!("expected AUTH_SUCCESS, got {other:?}"),
            }),
        }
    }

    async fn drive_target_handshake(&mut self) -> Result<(), ProxyError> {
        let startup = self
            .startup_frame
            .clone()
            .ok_or(ProxyError::MissingStartup)?;
        let reply = self.exchange_with(Peer::Target, startup).await?;
        match self.decode(&reply)? {
            Message::Ready | Message::AuthSuccess => Ok(()),
            Message::Authenticate { .. } => {
                let version = reply.version();
                let stream_id = reply.stream_id();
                let username = self.target_credentials.username.clone().unwrap_or_default();
                let password = self.target_credentials.password.clone().unwrap_or_default();
                let auth_response = protocol::encode_sasl_plain_auth_response(
                    version, stream_id, &username, &password,
                );
                let reply = self.exchange_with(Peer::Target, auth_response).await?;
                match self.decode(&reply)? {
                    Message::AuthSuccess => Ok(()),
                    other => Err(ProxyError::HandshakeProtocol {
                        peer: Peer::Target,
                        detail: format!("expected AUTH_SUCCESS, got {other:?}"),
                    }),
                }
            }
            other => Err(ProxyError::HandshakeProtocol {
                peer: Peer::Target,
                detail: format!("{other:?}"),
            }),
        }
    }

    /// Auto-registers Target for the full event set immediately after its
    /// handshake succeeds, on an internal stream id no client request ever
    /// uses.
    async fn auto_register_target_events(&mut self) -> Result<(), ProxyError> {
        let version = self
            .startup_frame
            .as_ref()
            .map(|f| f.version())
            .unwrap_or(4);
        let register = protocol::encode_register_all_events(version, TARGET_AUTOREGISTER_STREAM_ID);
        let rx = self.shared.target.forward(register).await;
        match rx.await {
            Ok(_reply) => Ok(()),
            Err(_) => Err(ProxyError::UpstreamClosed(Peer::Target)),
        }
    }

    async fn recv_client_frame(&mut self) -> Result<RawFrame, ProxyError> {
        tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => Err(ProxyError::Shutdown),
            frame = self.client.request_inbox.recv() => {
                frame.ok_or(ProxyError::Shutdown)
            }
        }
    }

    async fn exchange_with(&self, peer: Peer, request: RawFrame) -> Result<RawFrame, ProxyError> {
        let connector = match peer {
            Peer::Origin => &self.shared.origin,
            Peer::Target => &self.shared.target,
            Peer::Client => unreachable!("handshake never exchanges with the client directly"),
        };
        let rx = connector.forward(request).await;
        rx.await.map_err(|_| ProxyError::UpstreamClosed(peer))
    }

    fn decode(&self, frame: &RawFrame) -> Result<Message, ProxyError> {
        self.shared
            .codec
            .decode_body(&frame.header, &frame.body)
            .map_err(ProxyError::from)
    }

    async fn send_to_client(&self, frame: RawFrame) {
        let _ = self.shared.response_outbox.send(frame).await;
    }

    // ---- Request loop ---------------------------------------------------

    /// Only dispatches once the handshake gate above has returned `Ok`: no
    /// per-request task is spawned before that point, so `handshake_ready`
    /// never needs its own synchronization primitive — it is simply "has
    /// `run_handshake` returned".
    async fn run_request_loop(&mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => break,
                frame = self.client.request_inbox.recv() => {
                    match frame {
                        Some(frame) => {
                            let shared = self.shared.clone();
                            tokio::spawn(async move {
                                handle_request(shared, frame).await;
                            });
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

/// Handles one client request end to end: inspect, dispatch, aggregate,
/// apply post-response side effects, and write the result to the client.
/// Runs as its own short-lived task.
#[instrument(skip(shared, frame), fields(stream_id = frame.stream_id()))]
async fn handle_request(shared: Shared, frame: RawFrame) {
    let classified = match inspector::inspect(&frame, shared.codec.as_ref(), &shared.cache) {
        Ok(classified) => classified,
        Err(InspectError::Unprepared(unprepared)) => {
            trace!(prepared_id = ?unprepared.prepared_id, "execute missed prepared cache");
            shared.metrics.increment_count(Series::UnpreparedReads);
            let response = protocol::encode_unprepared_frame(
                unprepared.version,
                unprepared.stream_id,
                &unprepared.prepared_id,
            );
            let _ = shared.response_outbox.send(response).await;
            return;
        }
        Err(InspectError::Malformed(err)) => {
            warn!(error = %err, "could not classify request, dropping connection");
            shared.shutdown.trigger();
            return;
        }
    };

    let response = match classified.decision {
        // A decoded `message` is only present for the actual read/write
        // opcodes (Query/Prepare/Execute); REGISTER and other control
        // opcodes also route to Origin (inspector.rs) but carry no message,
        // which is what distinguishes a metered read from control traffic.
        ForwardDecision::Origin => {
            let is_read = classified.message.is_some();
            dispatch_single(&shared, Peer::Origin, frame, is_read).await
        }
        ForwardDecision::Target => dispatch_single(&shared, Peer::Target, frame, false).await,
        ForwardDecision::Both => dispatch_both(&shared, frame).await,
    };

    let Some(response) = response else {
        // An upstream closed mid-flight; the client sees a connection
        // drop, not a synthesized reply.
        return;
    };

    apply_post_response_side_effects(&shared, &classified, &response).await;
    let _ = shared.response_outbox.send(response).await;
}

/// Single-upstream dispatch: `Origin`-only reads and control opcodes, or
/// the rare `Target`-only path. `is_read` gates metering against the named
/// read series; REGISTER and other control opcodes also route to `Origin`
/// but are not reads, and must not be counted as one.
async fn dispatch_single(shared: &Shared, peer: Peer, frame: RawFrame, is_read: bool) -> Option<RawFrame> {
    let connector = match peer {
        Peer::Origin => &shared.origin,
        Peer::Target => &shared.target,
        Peer::Client => unreachable!("requests are never dispatched to the client"),
    };

    if is_read {
        shared.metrics.increment_count(Series::InFlightReadRequests);
    }
    let start = Instant::now();
    let rx = connector.forward(frame).await;
    let response = rx.await.ok();
    if is_read {
        shared.metrics.decrement_count(Series::InFlightReadRequests);
    }
    let response = response?;

    if is_read {
        record_read_metrics(shared, &response, start);
    }
    Some(response)
}

fn record_read_metrics(shared: &Shared, response: &RawFrame, start: Instant) {
    shared
        .metrics
        .track_in_histogram(Series::ProxyReadLatencyHist, start);
    shared
        .metrics
        .track_in_histogram(Series::OriginReadLatencyHist, start);
    if matches!(response.opcode(), OpCode::Error) {
        shared.metrics.increment_count(Series::FailedReads);
        if is_read_timeout(response) {
            shared
                .metrics
                .increment_count(Series::ReadTimeoutsOriginCluster);
        }
    } else {
        shared.metrics.increment_count(Series::SuccessReads);
    }
}

fn is_read_timeout(frame: &RawFrame) -> bool {
    matches!(frame.opcode(), OpCode::Error) && error_code_is(frame, protocol::ErrorCode::ReadTimeout)
}

fn is_write_timeout(frame: &RawFrame) -> bool {
    matches!(frame.opcode(), OpCode::Error) && error_code_is(frame, protocol::ErrorCode::WriteTimeout)
}

fn error_code_is(frame: &RawFrame, want: protocol::ErrorCode) -> bool {
    if frame.body.len() < 4 {
        return false;
    }
    let code = u32::from_be_bytes([frame.body[0], frame.body[1], frame.body[2], frame.body[3]]);
    protocol::ErrorCode::from_u32(code) == want
}

/// Dual-dispatch with aggregation. Both `forward` calls are launched before
/// either is awaited.
async fn dispatch_both(shared: &Shared, frame: RawFrame) -> Option<RawFrame> {
    let origin_frame = frame.clone();
    let target_frame = frame;

    shared.metrics.increment_count(Series::InFlightWriteRequests);
    let start = Instant::now();
    let origin_rx = shared.origin.forward(origin_frame).await;
    let target_rx = shared.target.forward(target_frame).await;

    let (origin_result, target_result) = tokio::join!(origin_rx, target_rx);
    shared.metrics.decrement_count(Series::InFlightWriteRequests);

    shared
        .metrics
        .track_in_histogram(Series::ProxyWriteLatencyHist, start);

    match (origin_result, target_result) {
        (Ok(origin_response), Ok(target_response)) => {
            shared
                .metrics
                .track_in_histogram(Series::OriginWriteLatencyHist, start);
            shared
                .metrics
                .track_in_histogram(Series::TargetWriteLatencyHist, start);
            Some(aggregate(shared, origin_response, target_response))
        }
        // Partial failure of one connector surfaces as a closed oneshot:
        // the request errors even though the aggregation rule below would
        // otherwise have a response to hand back from the side that
        // answered.
        (Ok(_), Err(_)) | (Err(_), Ok(_)) => None,
        (Err(_), Err(_)) => None,
    }
}

/// The aggregation rule: a response is successful iff its opcode is not
/// `ERROR`. Both succeed → Origin's response. Both fail → Origin's
/// response. Exactly one fails → the failed response.
fn aggregate(shared: &Shared, origin: RawFrame, target: RawFrame) -> RawFrame {
    let origin_ok = !matches!(origin.opcode(), OpCode::Error);
    let target_ok = !matches!(target.opcode(), OpCode::Error);

    match (origin_ok, target_ok) {
        (true, true) => {
            shared.metrics.increment_count(Series::SuccessBothWrites);
            origin
        }
        (false, false) => {
            shared.metrics.increment_count(Series::FailedBothWrites);
            record_write_failure_kind(shared, Peer::Origin, &origin);
            record_write_failure_kind(shared, Peer::Target, &target);
            origin
        }
        (true, false) => {
            shared
                .metrics
                .increment_count(Series::FailedTargetOnlyWrites);
            record_write_failure_kind(shared, Peer::Target, &target);
            target
        }
        (false, true) => {
            shared
                .metrics
                .increment_count(Series::FailedOriginOnlyWrites);
            record_write_failure_kind(shared, Peer::Origin, &origin);
            origin
        }
    }
}

fn record_write_failure_kind(shared: &Shared, peer: Peer, response: &RawFrame) {
    if is_write_timeout(response) {
        match peer {
            Peer::Origin => shared
                .metrics
                .increment_count(Series::WriteTimeoutsOriginCluster),
            Peer::Target => shared
                .metrics
                .increment_count(Series::WriteTimeoutsTargetCluster),
            Peer::Client => unreachable!(),
        }
    }
    if error_code_is(response, protocol::ErrorCode::Unprepared) {
        match peer {
            Peer::Origin => shared
                .metrics
                .increment_count(Series::UnpreparedOriginWrites),
            Peer::Target => shared
                .metrics
                .increment_count(Series::UnpreparedTargetWrites),
            Peer::Client => unreachable!(),
        }
    }
}

/// Post-response side effects: cache a newly prepared statement, or update
/// the tracked current keyspace. Only runs on responses the coordinator
/// can attribute to a single decoded request message; batches and
/// unclassified opcodes pass through untouched.
async fn apply_post_response_side_effects(
    shared: &Shared,
    classified: &Classified,
    response: &RawFrame,
) {
    if matches!(response.opcode(), OpCode::Error) {
        return;
    }
    let Ok(message) = shared
        .codec
        .decode_body(&response.header, &response.body)
    else {
        return;
    };

    match message {
        Message::Result(ResultBody::Prepared { prepared_id }) => {
            let Some(Message::Prepare { cql }) = &classified.message else {
                return;
            };
            shared.cache.insert(
                prepared_id,
                PreparedEntry {
                    intent: protocol::classify_cql(cql),
                    cql: cql.clone(),
                },
            );
            debug!("cached newly prepared statement");
        }
        Message::Result(ResultBody::SetKeyspace { keyspace }) => {
            shared.current_keyspace.store(Some(Arc::new(keyspace)));
        }
        _ => {}
    }
}

/// Event multiplexing: `SchemaChange` only from Origin; `StatusChange`/
/// `TopologyChange` only from Target. Everything else is dropped with a log
/// line.
async fn run_event_merger(
    mut origin_events: mpsc::Receiver<RawFrame>,
    mut target_events: mpsc::Receiver<RawFrame>,
    response_outbox: mpsc::Sender<RawFrame>,
    shutdown: Shutdown,
    codec: Arc<dyn Codec>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = origin_events.recv() => {
                match event {
                    Some(frame) => forward_event_if_qualifying(Peer::Origin, frame, &response_outbox, codec.as_ref()).await,
                    None => break,
                }
            }
            event = target_events.recv() => {
                match event {
                    Some(frame) => forward_event_if_qualifying(Peer::Target, frame, &response_outbox, codec.as_ref()).await,
                    None => break,
                }
            }
        }
    }
}

async fn forward_event_if_qualifying(
    origin_peer: Peer,
    frame: RawFrame,
    response_outbox: &mpsc::Sender<RawFrame>,
    codec: &dyn Codec,
) {
    let decoded = codec.decode_body(&frame.header, &frame.body);
    let qualifies = match decoded {
        Ok(Message::Event { kind }) => match (origin_peer, kind) {
            (Peer::Origin, protocol::EventKind::SchemaChange) => true,
            (Peer::Target, protocol::EventKind::StatusChange) => true,
            (Peer::Target, protocol::EventKind::TopologyChange) => true,
            _ => false,
        },
        _ => false,
    };
    if qualifies {
        let _ = response_outbox.send(frame).await;
    } else {
        trace!(peer = ?origin_peer, "dropping non-qualifying event");
    }
}
