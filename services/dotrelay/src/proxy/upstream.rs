//! Upstream connection establishment.
//!
//! Every client gets its own upstream socket; nothing is pooled. A connect
//! attempt is a TCP connect bounded by the connect timeout, followed by a TLS
//! handshake when outbound TLS is enabled. Failed attempts are retried with
//! exponential backoff up to the policy's attempt count.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::stream::ProxyStream;
use super::tls::TlsOriginator;
use crate::config::{ProxyConfig, RetryPolicy};
use crate::error::{ProxyError, Result};

/// Dials the fixed upstream for each client connection.
pub struct UpstreamConnector {
    host: String,
    port: u16,
    authority: String,
    tls: Option<TlsOriginator>,
    connect_timeout: Duration,
    retry: RetryPolicy,
    /// Total connect attempts, including retries.
    attempts: AtomicU64,
    /// Total connections established.
    established: AtomicU64,
}

impl UpstreamConnector {
    /// Build a connector from the relay configuration.
    ///
    /// Loads the outbound trust store when TLS is enabled, so a bad CA file
    /// fails here rather than on the first client.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let tls = if config.outbound_tls {
            Some(TlsOriginator::new(
                config.upstream_tls_name(),
                config.upstream_ca_path.as_deref(),
                config.handshake_timeout,
            )?)
        } else {
            None
        };

        Ok(Self::new(
            config.upstream_host.clone(),
            config.upstream_port,
            tls,
            config.connect_timeout,
            config.retry,
        ))
    }

    pub fn new(
        host: String,
        port: u16,
        tls: Option<TlsOriginator>,
        connect_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let authority = ProxyConfig::new(host.clone(), port).upstream_authority();
        Self {
            host,
            port,
            authority,
            tls,
            connect_timeout,
            retry,
            attempts: AtomicU64::new(0),
            established: AtomicU64::new(0),
        }
    }

    /// Upstream as `host:port`.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Establish a new upstream connection, retrying per the policy.
    pub async fn connect(&self) -> Result<ProxyStream> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.attempts.fetch_add(1, Ordering::Relaxed);

            match self.try_connect().await {
                Ok(stream) => {
                    self.established.fetch_add(1, Ordering::Relaxed);
                    debug!(upstream = %self.authority, attempt, "Connected to upstream");
                    return Ok(stream);
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        upstream = %self.authority,
                        attempt,
                        max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upstream connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(ProxyError::UpstreamConnect {
                        upstream: self.authority.clone(),
                        attempts: attempt,
                        detail: e.to_string(),
                    });
                }
            }
        }
    }

    /// A single connect attempt, including the TLS handshake.
    async fn try_connect(&self) -> io::Result<ProxyStream> {
        let stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout"));
            }
        };
        stream.set_nodelay(true)?;

        match &self.tls {
            Some(tls) => Ok(tls.connect(stream).await?.into()),
            None => Ok(stream.into()),
        }
    }

    /// Connection statistics.
    pub fn stats(&self) -> UpstreamStats {
        UpstreamStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            established: self.established.load(Ordering::Relaxed),
        }
    }
}

/// Statistics for the upstream connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamStats {
    pub attempts: u64,
    pub established: u64,
}
