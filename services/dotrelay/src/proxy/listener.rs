//! TCP listener and per-connection handling.
//!
//! The accept loop admits each client through the registry, then hands it to
//! its own task which:
//! - terminates TLS when inbound TLS is configured
//! - dials the upstream (with TLS when configured)
//! - relays bytes until both directions finish
//!
//! Accept errors never stop the loop. Only shutdown does, and the listening
//! socket is closed when [`Listener::run`] returns.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::connection::{Connection, ConnectionState};
use super::pipe::{relay, RelaySummary};
use super::registry::ConnectionRegistry;
use super::stream::ProxyStream;
use super::tls::TlsTerminator;
use super::upstream::UpstreamConnector;
use crate::error::{ProxyError, Result};

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// The relay's accept loop.
pub struct Listener {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    terminator: Option<TlsTerminator>,
    connector: Arc<UpstreamConnector>,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        terminator: Option<TlsTerminator>,
        connector: Arc<UpstreamConnector>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;

        info!(
            bind_addr = %listener.local_addr().unwrap_or(addr),
            max_connections = registry.max_connections(),
            inbound_tls = terminator.is_some(),
            "Listener bound"
        );

        Ok(Self {
            listener,
            registry,
            terminator,
            connector,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let local_addr = self.listener.local_addr().ok();
        info!(bind_addr = ?local_addr, "Listener started");

        if *shutdown.borrow() {
            return;
        }

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.dispatch(stream, peer_addr),
                    Err(e) => {
                        let e = ProxyError::Accept(e);
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        info!(bind_addr = ?local_addr, "Listener stopped accepting");
    }

    fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let guard = match self.registry.try_register(peer_addr) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(
                    peer_addr = %peer_addr,
                    reason = e.reason_code(),
                    "Connection rejected"
                );
                // Dropping the socket closes it.
                return;
            }
        };

        let conn = guard.connection();
        debug!(id = %conn.id(), peer_addr = %peer_addr, "Connection accepted");

        self.registry.spawn(
            guard,
            handle_connection(
                stream,
                conn,
                self.terminator.clone(),
                Arc::clone(&self.connector),
            ),
        );
    }
}

/// Set TCP_NODELAY, logging instead of failing the connection.
fn enable_nodelay(stream: &TcpStream) -> bool {
    match stream.set_nodelay(true) {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "Failed to set TCP_NODELAY");
            false
        }
    }
}

/// Handle a single connection from accept to end of relay.
async fn handle_connection(
    client: TcpStream,
    conn: Arc<Connection>,
    terminator: Option<TlsTerminator>,
    connector: Arc<UpstreamConnector>,
) -> Result<RelaySummary> {
    enable_nodelay(&client);

    let client: ProxyStream = match &terminator {
        Some(terminator) => terminator.accept(client).await?.into(),
        None => client.into(),
    };

    let upstream = connector.connect().await?;

    conn.advance(ConnectionState::Relaying);
    debug!(
        upstream = %connector.authority(),
        client_tls = client.is_tls(),
        upstream_tls = upstream.is_tls(),
        "Relaying"
    );

    let summary = relay(client, upstream, &conn).await?;
    conn.advance(ConnectionState::Closing);
    Ok(summary)
}
