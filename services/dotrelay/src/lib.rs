//! dotrelay
//!
//! A TCP relay with optional TLS on either side, built to forward
//! DNS-over-TLS clients to a fixed resolver. Payload bytes pass through
//! unmodified, so any TCP protocol works.

pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod server;

pub use config::{InboundTls, LogFormat, ProxyConfig, RetryPolicy};
pub use error::{ProxyError, Result};
pub use proxy::{
    CloseReason, Connection, ConnectionId, ConnectionRegistry, ConnectionSnapshot,
    ConnectionState, DrainReport, RelayStats, RelaySummary,
};
pub use server::{RelayHandle, RelayServer};
