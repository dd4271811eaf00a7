//! The accept loop: binds the query listener, dials both upstream clusters
//! per accepted client, and spawns a [`ClientHandler`] for each connection.
//! Shutdown is driven by `SIGINT`/`SIGTERM`, fanned out to every accepted
//! connection via a process-wide [`Shutdown`].

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, instrument, warn};

use crate::cache::PreparedStatementCache;
use crate::config::Configuration;
use crate::handler::{ClientHandler, TargetCredentials};
use crate::metrics::MetricsHandler;
use crate::protocol::{Codec, WireCodec};
use crate::shutdown::Shutdown;

/// Runs the proxy until a termination signal arrives. Each accepted client
/// connection gets its own Origin and Target upstream sockets and its own
/// `ClientHandler` task; one client's failure never affects another's. On
/// `SIGINT`/`SIGTERM` the process-wide `Shutdown` is triggered, tearing down
/// every already-accepted connection rather than just closing the listener.
pub async fn run(config: Configuration, metrics: Arc<dyn MetricsHandler>) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.query_listen).await?;
    info!(addr = %config.query_listen, "listening for client connections");

    let codec: Arc<dyn Codec> = Arc::new(WireCodec);
    let cache = Arc::new(PreparedStatementCache::new(config.prepared_cache_capacity));
    let shutdown = Shutdown::new();

    loop {
        tokio::select! {
            biased;
            _ = wait_for_shutdown_signal() => {
                info!("received shutdown signal, tearing down connections");
                shutdown.trigger();
                return Ok(());
            }
            accepted = listener.accept() => {
                let (client_socket, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "failed to accept client connection");
                        continue;
                    }
                };

                let config = config.clone();
                let codec = Arc::clone(&codec);
                let cache = Arc::clone(&cache);
                let metrics = Arc::clone(&metrics);
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    if let Err(err) = accept_and_run(peer_addr, client_socket, &config, codec, cache, metrics, shutdown).await {
                        warn!(client = %peer_addr, error = %err, "connection failed before handshake");
                    }
                });
            }
        }
    }
}

#[instrument(skip(client_socket, config, codec, cache, metrics, shutdown), fields(client = %peer_addr))]
async fn accept_and_run(
    peer_addr: std::net::SocketAddr,
    client_socket: TcpStream,
    config: &Configuration,
    codec: Arc<dyn Codec>,
    cache: Arc<PreparedStatementCache>,
    metrics: Arc<dyn MetricsHandler>,
    shutdown: Shutdown,
) -> std::io::Result<()> {
    let origin_socket = TcpStream::connect(config.origin.contact_point).await?;
    let target_socket = TcpStream::connect(config.target.contact_point).await?;

    let target_credentials = TargetCredentials {
        username: config.target.username.clone(),
        password: config.target.password.clone(),
    };

    let handler = ClientHandler::new(
        client_socket,
        origin_socket,
        target_socket,
        codec,
        cache,
        metrics,
        target_credentials,
        shutdown,
    );

    handler.run().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
                unreachable!()
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
