//! Error types for the relay.
//!
//! Fatal variants stop the process before any connection is served. Every
//! other variant is scoped to a single connection and never reaches the
//! listener.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Relay errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration rejected during validation.
    #[error("config_invalid: {0}")]
    Config(String),

    /// Could not bind the listening socket.
    #[error("bind_failed: {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Could not load certificate or key material.
    #[error("cert_load_failed: {}: {detail}", path.display())]
    CertLoad { path: PathBuf, detail: String },

    /// Accepting a client failed. The accept loop keeps running.
    #[error("accept_failed: {0}")]
    Accept(#[source] io::Error),

    /// TLS handshake with the client failed or timed out.
    #[error("handshake_failed: {0}")]
    Handshake(String),

    /// Upstream could not be reached after all attempts.
    #[error("upstream_connect_failed: {upstream} after {attempts} attempt(s): {detail}")]
    UpstreamConnect {
        upstream: String,
        attempts: u32,
        detail: String,
    },

    /// Read or write failed while relaying.
    #[error("relay_io: {0}")]
    RelayIo(#[from] io::Error),

    /// No traffic in either direction for the idle window.
    #[error("idle_timeout: no traffic for {0:?}")]
    IdleTimeout(Duration),

    /// The process is shutting down and the connection was closed.
    #[error("shutdown_requested")]
    ShutdownRequested,

    /// Connection refused because the registry is full.
    #[error("at_capacity: {max_connections} connections active")]
    AtCapacity { max_connections: usize },

    /// Connection refused because the registry no longer admits connections.
    #[error("shutting_down")]
    ShuttingDown,
}

impl ProxyError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "config_invalid",
            ProxyError::Bind { .. } => "bind_failed",
            ProxyError::CertLoad { .. } => "cert_load_failed",
            ProxyError::Accept(_) => "accept_failed",
            ProxyError::Handshake(_) => "handshake_failed",
            ProxyError::UpstreamConnect { .. } => "upstream_connect_failed",
            ProxyError::RelayIo(_) => "relay_io",
            ProxyError::IdleTimeout(_) => "idle_timeout",
            ProxyError::ShutdownRequested => "shutdown_requested",
            ProxyError::AtCapacity { .. } => "at_capacity",
            ProxyError::ShuttingDown => "shutting_down",
        }
    }

    /// Whether this error must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::Config(_) | ProxyError::Bind { .. } | ProxyError::CertLoad { .. }
        )
    }

    pub(crate) fn cert_load(path: impl Into<PathBuf>, detail: impl ToString) -> Self {
        ProxyError::CertLoad {
            path: path.into(),
            detail: detail.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
