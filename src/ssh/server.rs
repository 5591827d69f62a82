//! Connection acceptor
//!
//! Owns the listening socket. The accept loop does nothing but accept and
//! spawn; handshakes and sessions run in per-connection tasks.

use std::io;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handler::ConnectionHandler;
use super::mux::SessionHandler;
use super::ServerConfig;
use crate::config::Config;
use crate::identity::{self, IdentityError};

/// Pause after a failed accept so persistent failures (fd exhaustion) don't spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Startup failures; everything after startup is contained per connection
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("failed to bind listener")]
    Bind(#[source] io::Error),
}

/// SSH server handing granted shells to a [`SessionHandler`]
#[derive(Clone)]
pub struct LineServer {
    config: Arc<ServerConfig>,
    handler: Arc<dyn SessionHandler>,
}

impl LineServer {
    pub fn new(config: ServerConfig, handler: impl SessionHandler) -> Self {
        Self {
            config: Arc::new(config),
            handler: Arc::new(handler),
        }
    }

    /// Load or create the host identity named by `config` and register `handler`
    pub fn init(config: &Config, handler: impl SessionHandler) -> Result<Self, ServerError> {
        let identity =
            identity::ensure_identity(&config.host_key_path, config.host_key_algorithm)?;
        info!(fingerprint = %identity.fingerprint(), "host identity ready");
        Ok(Self::new(ServerConfig::from_config(identity, config), handler))
    }

    /// Bind `addr` and serve forever
    ///
    /// Only returns on bind failure.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        self.serve(listener).await;
        Ok(())
    }

    /// Serve connections from an already bound listener, forever
    pub async fn serve(&self, listener: TcpListener) {
        self.serve_until(listener, CancellationToken::new()).await;
    }

    /// Serve connections until `shutdown` is cancelled
    ///
    /// Connections already accepted keep running after shutdown.
    pub async fn serve_until(&self, listener: TcpListener, shutdown: CancellationToken) {
        info!(addr = ?listener.local_addr().ok(), "listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("listener shut down");
                    return;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move { server.handle_connection(stream, peer).await });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        info!(%peer, "new connection");
        let _ = stream.set_nodelay(true);

        let authenticated = Arc::new(Notify::new());
        let handler = ConnectionHandler::new(
            self.config.clone(),
            self.handler.clone(),
            Some(peer),
            authenticated.clone(),
        );
        let deadline = self.config.handshake_timeout.map(|limit| Instant::now() + limit);

        let handshake = russh::server::run_stream(self.config.transport(), stream, handler);
        let started = match deadline {
            Some(deadline) => match timeout_at(deadline, handshake).await {
                Ok(started) => started,
                Err(_) => {
                    warn!(%peer, "handshake timed out");
                    return;
                }
            },
            None => handshake.await,
        };
        let running = match started {
            Ok(running) => running,
            Err(e) => {
                warn!(%peer, error = %e, "handshake failed");
                return;
            }
        };

        let handle = running.handle();
        let mut running = pin!(running);

        if let Some(deadline) = deadline {
            tokio::select! {
                result = &mut running => {
                    log_connection_end(peer, result);
                    return;
                }
                authed = timeout_at(deadline, authenticated.notified()) => {
                    if authed.is_err() {
                        warn!(%peer, "handshake timed out");
                        let _ = handle
                            .disconnect(
                                russh::Disconnect::ByApplication,
                                "handshake timed out".into(),
                                "en".into(),
                            )
                            .await;
                    }
                }
            }
        }

        log_connection_end(peer, running.await);
    }
}

fn log_connection_end(peer: SocketAddr, result: anyhow::Result<()>) {
    match result {
        Ok(()) => info!(%peer, "connection closed"),
        Err(e) => debug!(%peer, error = %e, "connection ended with error"),
    }
}
