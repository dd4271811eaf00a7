//! `ClusterConnector`: one per upstream cluster, owning the TCP connection
//! to that cluster and stream-id-demuxing its responses back to whichever
//! `forward` call is waiting on them.

use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::error::Peer;
use crate::protocol::{CqlFrameCodec, RawFrame};
use crate::shutdown::Shutdown;

const REQUEST_CHANNEL_CAPACITY: usize = 128;
/// Event channels are advisory and small; overflow drops the event rather
/// than applying backpressure to the reader.
const EVENTS_CHANNEL_CAPACITY: usize = 32;

type PendingMap = Arc<DashMap<i16, oneshot::Sender<RawFrame>>>;

pub struct ClusterConnector {
    peer: Peer,
    pending: PendingMap,
    request_tx: mpsc::Sender<RawFrame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClusterConnector {
    /// Spawns the connector and returns it alongside its events receiver.
    /// The receiver is handed out separately (rather than kept as a field)
    /// because the connector itself is shared (`Arc`) across every
    /// in-flight request's `forward` call, while the events channel has a
    /// single owner: the event-merger task.
    pub fn spawn(peer: Peer, socket: TcpStream, shutdown: Shutdown) -> (Self, mpsc::Receiver<RawFrame>) {
        let framed = Framed::new(socket, CqlFrameCodec::default());
        let (mut sink, mut stream) = framed.split();

        let pending: PendingMap = Arc::new(DashMap::new());
        let (request_tx, mut request_rx) = mpsc::channel::<RawFrame>(REQUEST_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);

        let reader_pending = Arc::clone(&pending);
        let reader_shutdown = shutdown.clone();
        let reader_peer = peer;
        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = reader_shutdown.cancelled() => break,
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(frame)) => {
                                if frame.header.is_event() {
                                    // Advisory: drop silently on overflow.
                                    let _ = events_tx.try_send(frame);
                                    continue;
                                }
                                match reader_pending.remove(&frame.stream_id()) {
                                    Some((_, tx)) => {
                                        let _ = tx.send(frame);
                                    }
                                    None => {
                                        warn!(
                                            peer = %reader_peer,
                                            stream_id = frame.stream_id(),
                                            "response for unknown or already-completed stream id, dropping"
                                        );
                                    }
                                }
                            }
                            Some(Err(err)) => {
                                warn!(peer = %reader_peer, error = %err, "upstream read error");
                                break;
                            }
                            None => {
                                debug!(peer = %reader_peer, "upstream closed connection (EOF)");
                                break;
                            }
                        }
                    }
                }
            }
            // Every pending oneshot is closed (not completed) on shutdown,
            // so callers observe a closed channel.
            reader_pending.clear();
            reader_shutdown.trigger();
        });

        let writer_shutdown = shutdown;
        let writer_peer = peer;
        let writer = tokio::spawn(async move {
            while let Some(frame) = request_rx.recv().await {
                if let Err(err) = sink.send(frame).await {
                    warn!(peer = %writer_peer, error = %err, "upstream write error");
                    break;
                }
            }
            let _ = sink.flush().await;
            writer_shutdown.trigger();
        });

        let connector = Self {
            peer,
            pending,
            request_tx,
            reader,
            writer,
        };
        (connector, events_rx)
    }

    /// Ships `request` to the upstream and returns a receiver that resolves
    /// with the matching response, keyed by the request's stream id. If the
    /// upstream connection is gone, the returned receiver resolves to a
    /// closed-channel error rather than this call failing synchronously, so
    /// dual-dispatch call sites can `await` both uniformly.
    pub async fn forward(&self, request: RawFrame) -> oneshot::Receiver<RawFrame> {
        let stream_id = request.stream_id();
        let (tx, rx) = oneshot::channel();

        if let Some(previous) = self.pending.insert(stream_id, tx) {
            // A stream id must be held by exactly one in-flight request at
            // a time. Close the stale entry rather than let it hang forever.
            drop(previous);
            warn!(peer = %self.peer, stream_id, "stream id already had a pending request");
        }

        trace!(peer = %self.peer, stream_id, opcode = ?request.opcode(), "forwarding request");
        if self.request_tx.send(request).await.is_err() {
            // Writer is gone; fail the just-registered pending entry
            // immediately instead of waiting for the reader to notice.
            if let Some((_, tx)) = self.pending.remove(&stream_id) {
                drop(tx);
            }
        }

        rx
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}
