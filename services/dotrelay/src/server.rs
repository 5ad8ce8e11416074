//! Relay server lifecycle.
//!
//! ```text
//! RelayServer::bind(config)      load certs, build connector, bind (all fatal)
//!       |
//!       v
//! RelayServer::start() --> RelayHandle
//!       |                       |
//!       v                       |
//! listener + idle reaper        |
//!       |                       v
//!       |               RelayHandle::shutdown()
//!       v                       |
//! stop accepting, drain <-------+
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::proxy::{
    ConnectionRegistry, DrainReport, Listener, TlsTerminator, UpstreamConnector,
};

/// A bound but not yet serving relay.
pub struct RelayServer {
    config: Arc<ProxyConfig>,
    listener: Listener,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    connector: Arc<UpstreamConnector>,
}

impl RelayServer {
    /// Validate the configuration, load TLS material and bind.
    ///
    /// Certificates are loaded before the socket is bound, so a bad
    /// certificate never leaves a half-started listener behind.
    pub async fn bind(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let terminator = config
            .inbound_tls
            .as_ref()
            .map(|tls| TlsTerminator::from_files(tls, config.handshake_timeout))
            .transpose()?;
        let connector = Arc::new(UpstreamConnector::from_config(&config)?);
        let registry = Arc::new(ConnectionRegistry::new(
            config.max_connections,
            config.idle_timeout,
        ));

        let listener = Listener::bind(
            config.listen_addr(),
            Arc::clone(&registry),
            terminator,
            Arc::clone(&connector),
        )
        .await?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind {
                addr: config.listen_addr(),
                source,
            })?;

        Ok(Self {
            config: Arc::new(config),
            listener,
            local_addr,
            registry,
            connector,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Start accepting and reaping idle connections.
    pub fn start(self) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            listen_addr = %self.local_addr,
            upstream = %self.connector.authority(),
            inbound_tls = self.config.inbound_tls.is_some(),
            outbound_tls = self.connector.is_tls(),
            idle_timeout_ms = self.config.idle_timeout.map(|t| t.as_millis() as u64),
            max_connections = self.config.max_connections,
            "Relay started"
        );

        let listener_task = tokio::spawn(self.listener.run(shutdown_rx.clone()));
        let reaper_task = tokio::spawn(Arc::clone(&self.registry).run_idle_reaper(shutdown_rx));

        RelayHandle {
            config: self.config,
            local_addr: self.local_addr,
            registry: self.registry,
            connector: self.connector,
            shutdown_tx,
            listener_task,
            reaper_task,
        }
    }
}

/// Handle to a running relay.
pub struct RelayHandle {
    config: Arc<ProxyConfig>,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    connector: Arc<UpstreamConnector>,
    shutdown_tx: watch::Sender<bool>,
    listener_task: JoinHandle<()>,
    reaper_task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn connector(&self) -> Arc<UpstreamConnector> {
        Arc::clone(&self.connector)
    }

    /// Stop accepting, drain connections within the grace period, and wait
    /// for background tasks to finish.
    pub async fn shutdown(self) -> DrainReport {
        info!("Shutting down relay");
        self.shutdown_tx.send_replace(true);
        self.registry.stop_accepting();

        if let Err(e) = self.listener_task.await {
            warn!(error = %e, "Listener task failed");
        }

        let report = self.registry.shutdown(self.config.shutdown_grace).await;

        if let Err(e) = self.reaper_task.await {
            warn!(error = %e, "Idle reaper task failed");
        }

        info!(
            in_flight = report.in_flight,
            drained = report.drained,
            forced = report.forced,
            "Relay shutdown complete"
        );
        report
    }
}
