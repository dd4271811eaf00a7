//! `ClientConnector` (spec §4.1): framed I/O with the client, exposing a
//! request inbox and a response outbox. Reader and writer are independent
//! tasks; the writer is the single place frames are serialized onto the
//! wire, which is what gives per-connection FIFO delivery.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::protocol::{CqlFrameCodec, RawFrame};
use crate::shutdown::Shutdown;

/// Bound on both the request inbox and the response outbox. Backpressure
/// on either throttles the other side of the connection (spec §5).
const CHANNEL_CAPACITY: usize = 128;

pub struct ClientConnector {
    pub request_inbox: mpsc::Receiver<RawFrame>,
    pub response_outbox: mpsc::Sender<RawFrame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientConnector {
    /// Spawns the reader and writer tasks over `socket` and returns the
    /// channel handles the coordinator drives.
    pub fn spawn(socket: TcpStream, shutdown: Shutdown) -> Self {
        let framed = Framed::new(socket, CqlFrameCodec::default());
        let (mut sink, mut stream) = framed.split();

        let (inbox_tx, inbox_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<RawFrame>(CHANNEL_CAPACITY);

        let reader_shutdown = shutdown.clone();
        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = reader_shutdown.cancelled() => break,
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(frame)) => {
                                if inbox_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(err)) => {
                                warn!(error = %err, "client read error, tearing down connection");
                                break;
                            }
                            None => {
                                debug!("client closed connection (EOF)");
                                break;
                            }
                        }
                    }
                }
            }
            reader_shutdown.trigger();
        });

        let writer_shutdown = shutdown;
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbox_rx.recv().await {
                if let Err(err) = sink.send(frame).await {
                    warn!(error = %err, "client write error, tearing down connection");
                    break;
                }
            }
            let _ = sink.flush().await;
            writer_shutdown.trigger();
        });

        Self {
            request_inbox: inbox_rx,
            response_outbox: outbox_tx,
            reader,
            writer,
        }
    }

    /// Aborts both tasks; used when the coordinator tears down for a reason
    /// other than the client socket itself closing.
    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}
