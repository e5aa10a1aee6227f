//! Proxy server: accept loop and connection spawning.
//!
//! # Responsibilities
//! - Bind the configured listen address
//! - Accept connections and spawn one handler task per connection
//! - Stop accepting when closed by the owner, without touching in-flight
//!   connections
//! - Tell an owner-initiated close apart from a failed accept

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::http::handler::ConnectionHandler;
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Forward proxy server.
///
/// `listen`/`serve` take `&self` so the owner can call `close` from another
/// task, typically through an `Arc<ProxyServer>` or a `shutdown_handle`.
pub struct ProxyServer {
    config: ProxyConfig,
    handler: ConnectionHandler,
    shutdown: Shutdown,
    tracker: ConnectionTracker,
}

impl ProxyServer {
    /// Create a new proxy server with the given configuration.
    pub fn new(config: ProxyConfig) -> Self {
        let handler = ConnectionHandler::new(&config);
        Self {
            config,
            handler,
            shutdown: Shutdown::new(),
            tracker: ConnectionTracker::new(),
        }
    }

    /// Bind the configured address and accept until closed.
    ///
    /// Returns `Ok(())` when the listener was closed through [`close`](Self::close),
    /// including a close that happened before this call.
    pub async fn listen(&self) -> Result<(), ServerError> {
        if self.shutdown.is_triggered() {
            return Ok(());
        }
        let listener = Listener::bind(&self.config.listener).await?;
        self.serve(listener).await
    }

    /// Accept on an already bound listener until closed.
    pub async fn serve(&self, listener: Listener) -> Result<(), ServerError> {
        let addr = listener.local_addr().map_err(ListenerError::Bind)?;
        tracing::info!(
            address = %addr,
            max_connections = listener.max_connections(),
            "Forward proxy listening"
        );

        loop {
            let accepted = tokio::select! {
                biased;
                () = self.shutdown.triggered() => {
                    tracing::info!(
                        address = %addr,
                        in_flight = self.tracker.active_count(),
                        free_slots = listener.available_permits(),
                        "Listener closed"
                    );
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer, permit)) => self.spawn_handler(stream, peer, permit),
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "Accept failed, continuing");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn spawn_handler(&self, stream: TcpStream, peer: std::net::SocketAddr, permit: ConnectionPermit) {
        let guard = self.tracker.track();
        let span = tracing::info_span!("connection", id = %guard.id(), peer = %peer);
        let handler = self.handler.clone();

        tokio::spawn(
            async move {
                let _permit = permit;
                let _guard = guard;
                handler.handle(stream).await;
            }
            .instrument(span),
        );
    }

    /// Stop accepting new connections. Idempotent; in-flight connections
    /// run to completion.
    pub fn close(&self) {
        if self.shutdown.trigger() {
            tracing::debug!("Close requested");
        }
    }

    /// Handle that closes this server when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Connections currently being handled.
    pub fn active_connections(&self) -> usize {
        self.tracker.active_count()
    }

    /// Wait for in-flight connections to finish, up to `timeout`.
    ///
    /// Returns `false` if some were still running at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.tracker.wait_idle())
            .await
            .is_ok()
    }
}
