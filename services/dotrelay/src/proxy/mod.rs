//! TCP/TLS relay implementation.
//!
//! This module provides:
//! - TCP listener and accept loop
//! - Inbound TLS termination and outbound TLS origination
//! - Upstream connection with timeout and bounded retry
//! - Bidirectional byte relay with half-close
//! - Connection registry with limits, idle timeout and drain
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Registry (admit) -> TLS Terminator -> Upstream Connector -> Upstream
//!                           |                                          |
//!                      idle reaper                                  Pipe (both directions)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ConnectionRegistry, Listener, UpstreamConnector};
//!
//! let registry = Arc::new(ConnectionRegistry::new(1024, Some(Duration::from_secs(60))));
//! let connector = Arc::new(UpstreamConnector::from_config(&config)?);
//!
//! let listener = Listener::bind("[::]:53".parse()?, registry, None, connector).await?;
//! listener.run(shutdown_rx).await;
//! ```

mod connection;
mod listener;
mod pipe;
mod registry;
mod stream;
mod tls;
mod upstream;

pub use connection::{
    CloseReason, Connection, ConnectionId, ConnectionIdError, ConnectionSnapshot,
    ConnectionState,
};
pub use listener::Listener;
pub use pipe::{relay, RelaySummary, RELAY_BUFFER_SIZE};
pub use registry::{ConnectionGuard, ConnectionRegistry, DrainReport, RelayStats};
pub use stream::ProxyStream;
pub use tls::{load_certs, load_private_key, TlsOriginator, TlsTerminator};
pub use upstream::{UpstreamConnector, UpstreamStats};
