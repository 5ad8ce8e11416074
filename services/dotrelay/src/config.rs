//! Relay configuration.
//!
//! Configuration comes from command-line flags with `DOTRELAY_*` environment
//! fallbacks. There is no config file. Once built and validated, a
//! [`ProxyConfig`] is shared read-only behind an `Arc`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

use crate::error::{ProxyError, Result};

/// Default listen port (plain DNS port, served over TLS).
pub const DEFAULT_LISTEN_PORT: u16 = 53;

/// Default upstream resolver.
pub const DEFAULT_UPSTREAM_HOST: &str = "1.1.1.1";

/// Default upstream port (DNS-over-TLS).
pub const DEFAULT_UPSTREAM_PORT: u16 = 853;

/// Default maximum concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Default idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default connect timeout for upstream connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default TLS handshake timeout, applied to both sides.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default grace period for draining connections at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Default certificate chain for inbound TLS.
pub const DEFAULT_TLS_CERT: &str = "./certificate.pem";

/// Default private key for inbound TLS.
pub const DEFAULT_TLS_KEY: &str = "./privatekey.pem";

/// Hard cap on upstream connect attempts.
pub const MAX_CONNECT_ATTEMPTS: u32 = 10;

/// Certificate and key for inbound TLS termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTls {
    /// PEM certificate chain, leaf first.
    pub cert_path: PathBuf,
    /// PEM private key (PKCS#1, PKCS#8 or SEC1).
    pub key_path: PathBuf,
}

impl InboundTls {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

/// Bounded retry policy for the initial upstream connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the delay between attempts.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// Doubles from `initial_backoff` and saturates at `max_backoff`.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to listen on.
    pub listen_host: IpAddr,

    /// Local port to listen on. Zero picks an ephemeral port.
    pub listen_port: u16,

    /// Upstream host name or IP address.
    pub upstream_host: String,

    /// Upstream port.
    pub upstream_port: u16,

    /// Terminate TLS on accepted connections when set.
    pub inbound_tls: Option<InboundTls>,

    /// Originate TLS to the upstream.
    pub outbound_tls: bool,

    /// Name presented as SNI and verified against the upstream certificate.
    /// Falls back to `upstream_host`.
    pub upstream_server_name: Option<String>,

    /// Extra PEM trust anchors for the upstream, added to the webpki roots.
    pub upstream_ca_path: Option<PathBuf>,

    /// Close connections with no traffic for this long. `None` disables.
    pub idle_timeout: Option<Duration>,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Timeout for each TCP connect attempt to the upstream.
    pub connect_timeout: Duration,

    /// Timeout for TLS handshakes on either side.
    pub handshake_timeout: Duration,

    /// Retry policy for the upstream connect.
    pub retry: RetryPolicy,

    /// How long shutdown waits for connections before force-closing them.
    pub shutdown_grace: Duration,
}

impl ProxyConfig {
    /// Create a configuration for the given upstream with default settings.
    ///
    /// Outbound TLS is off and the relay listens on an ephemeral loopback port;
    /// the binary applies its own defaults through [`Args`].
    pub fn new(upstream_host: impl Into<String>, upstream_port: u16) -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 0,
            upstream_host: upstream_host.into(),
            upstream_port,
            inbound_tls: None,
            outbound_tls: false,
            upstream_server_name: None,
            upstream_ca_path: None,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            retry: RetryPolicy::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_listen(mut self, host: IpAddr, port: u16) -> Self {
        self.listen_host = host;
        self.listen_port = port;
        self
    }

    pub fn with_inbound_tls(mut self, tls: InboundTls) -> Self {
        self.inbound_tls = Some(tls);
        self
    }

    pub fn with_outbound_tls(mut self, server_name: Option<String>, ca: Option<PathBuf>) -> Self {
        self.outbound_tls = true;
        self.upstream_server_name = server_name;
        self.upstream_ca_path = ca;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_host, self.listen_port)
    }

    /// Upstream as `host:port`, bracketing IPv6 literals.
    pub fn upstream_authority(&self) -> String {
        match self.upstream_host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.upstream_port),
            _ => format!("{}:{}", self.upstream_host, self.upstream_port),
        }
    }

    /// Name used for upstream SNI and certificate verification.
    pub fn upstream_tls_name(&self) -> &str {
        self.upstream_server_name
            .as_deref()
            .unwrap_or(&self.upstream_host)
    }

    /// Check the configuration for values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.upstream_host.trim().is_empty() {
            return Err(ProxyError::Config("upstream host must not be empty".into()));
        }
        if self.upstream_port == 0 {
            return Err(ProxyError::Config("upstream port must not be 0".into()));
        }
        if self.max_connections == 0 {
            return Err(ProxyError::Config(
                "max connections must be at least 1".into(),
            ));
        }
        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ProxyError::Config(
                "idle timeout must be positive (use None to disable)".into(),
            ));
        }
        if self.connect_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(ProxyError::Config(
                "connect and handshake timeouts must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 || self.retry.max_attempts > MAX_CONNECT_ATTEMPTS {
            return Err(ProxyError::Config(format!(
                "connect attempts must be between 1 and {}",
                MAX_CONNECT_ATTEMPTS
            )));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(ProxyError::Config(
                "initial backoff must not exceed max backoff".into(),
            ));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable multi-line output.
    Pretty,
    /// Human-readable single-line output.
    Compact,
}

/// Command-line arguments for the relay binary.
#[derive(Debug, Parser)]
#[command(name = "dotrelay", version, about = "TCP/TLS relay for DNS-over-TLS")]
pub struct Args {
    /// Address to listen on.
    #[arg(long, env = "DOTRELAY_LISTEN_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub listen_host: IpAddr,

    /// Port to listen on.
    #[arg(long, env = "DOTRELAY_LISTEN_PORT", default_value_t = DEFAULT_LISTEN_PORT)]
    pub listen_port: u16,

    /// Upstream host name or IP address.
    #[arg(long, env = "DOTRELAY_UPSTREAM_HOST", default_value = DEFAULT_UPSTREAM_HOST)]
    pub upstream_host: String,

    /// Upstream port.
    #[arg(long, env = "DOTRELAY_UPSTREAM_PORT", default_value_t = DEFAULT_UPSTREAM_PORT)]
    pub upstream_port: u16,

    /// Originate TLS to the upstream.
    #[arg(long, env = "DOTRELAY_UPSTREAM_TLS", default_value_t = true, action = ArgAction::Set)]
    pub upstream_tls: bool,

    /// Override the name used for upstream SNI and certificate checks.
    #[arg(long, env = "DOTRELAY_UPSTREAM_SERVER_NAME")]
    pub upstream_server_name: Option<String>,

    /// Additional PEM CA certificates trusted for the upstream.
    #[arg(long, env = "DOTRELAY_UPSTREAM_CA")]
    pub upstream_ca: Option<PathBuf>,

    /// PEM certificate chain for inbound TLS termination.
    #[arg(long, env = "DOTRELAY_TLS_CERT", default_value = DEFAULT_TLS_CERT)]
    pub tls_cert: PathBuf,

    /// PEM private key for inbound TLS termination.
    #[arg(long, env = "DOTRELAY_TLS_KEY", default_value = DEFAULT_TLS_KEY)]
    pub tls_key: PathBuf,

    /// Accept plain TCP clients instead of terminating TLS.
    #[arg(long, env = "DOTRELAY_NO_INBOUND_TLS", conflicts_with_all = ["tls_cert", "tls_key"])]
    pub no_inbound_tls: bool,

    /// Close connections idle for this many seconds (0 disables).
    #[arg(long, env = "DOTRELAY_IDLE_TIMEOUT_SECS", default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs())]
    pub idle_timeout_secs: u64,

    /// Maximum concurrent connections.
    #[arg(long, env = "DOTRELAY_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Upstream connect timeout in milliseconds.
    #[arg(long, env = "DOTRELAY_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// TLS handshake timeout in milliseconds.
    #[arg(long, env = "DOTRELAY_HANDSHAKE_TIMEOUT_MS", default_value_t = 10000)]
    pub handshake_timeout_ms: u64,

    /// Upstream connect attempts, including the first.
    #[arg(long, env = "DOTRELAY_CONNECT_ATTEMPTS", default_value_t = 3)]
    pub connect_attempts: u32,

    /// Seconds to wait for connections to drain at shutdown.
    #[arg(long, env = "DOTRELAY_SHUTDOWN_GRACE_SECS", default_value_t = DEFAULT_SHUTDOWN_GRACE.as_secs())]
    pub shutdown_grace_secs: u64,

    /// Log output format.
    #[arg(long, env = "DOTRELAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "DOTRELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Build and validate the relay configuration.
    pub fn into_config(self) -> Result<ProxyConfig> {
        let inbound_tls =
            (!self.no_inbound_tls).then(|| InboundTls::new(self.tls_cert, self.tls_key));

        let idle_timeout = match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let config = ProxyConfig {
            listen_host: self.listen_host,
            listen_port: self.listen_port,
            upstream_host: self.upstream_host,
            upstream_port: self.upstream_port,
            inbound_tls,
            outbound_tls: self.upstream_tls,
            upstream_server_name: self.upstream_server_name,
            upstream_ca_path: self.upstream_ca,
            idle_timeout,
            max_connections: self.max_connections,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            retry: RetryPolicy {
                max_attempts: self.connect_attempts,
                ..RetryPolicy::default()
            },
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        };

        config.validate()?;
        Ok(config)
    }
}
