//! Connection registry.
//!
//! The registry owns every live [`Connection`] record and drives each
//! connection as its own task. It is the only state shared across
//! connections: admission, removal and shutdown iteration go through a single
//! mutex that is never held across an await point.
//!
//! Responsibilities:
//! - Admission control against `max_connections`
//! - Idle timeout enforcement (no byte-count change within the window)
//! - Graceful drain on shutdown, then forced close after the grace period

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};

use super::connection::{
    CloseReason, Connection, ConnectionId, ConnectionSnapshot, ConnectionState,
};
use super::pipe::RelaySummary;
use crate::error::{ProxyError, Result};

/// How long forced close waits for tasks to unwind before aborting them.
const FORCE_CLOSE_WAIT: Duration = Duration::from_millis(500);

/// Registry-wide counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Connections admitted.
    pub connections_accepted: AtomicU64,
    /// Connections refused at capacity or during shutdown.
    pub connections_rejected: AtomicU64,
    /// Connections fully released.
    pub connections_closed: AtomicU64,
    /// Inbound TLS handshake failures.
    pub handshake_failed: AtomicU64,
    /// Upstream connect failures (after retries).
    pub upstream_failed: AtomicU64,
    /// Relay I/O errors.
    pub relay_errors: AtomicU64,
    /// Connections closed by the idle timeout.
    pub idle_closed: AtomicU64,
    /// Bytes relayed client to upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed upstream to client.
    pub bytes_from_upstream: AtomicU64,
}

/// Outcome of [`ConnectionRegistry::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Connections open when shutdown started.
    pub in_flight: usize,
    /// Connections that finished on their own within the grace period.
    pub drained: usize,
    /// Connections closed by force after the grace period.
    pub forced: usize,
}

struct Entry {
    conn: Arc<Connection>,
    task: Option<AbortHandle>,
}

struct RegistryInner {
    accepting: bool,
    connections: HashMap<ConnectionId, Entry>,
}

/// Owns live connections and their tasks.
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    max_connections: usize,
    idle_timeout: Option<Duration>,
    stats: RelayStats,
    /// Number of registered connections, for drain waits.
    live_tx: watch::Sender<usize>,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, idle_timeout: Option<Duration>) -> Self {
        let (live_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(RegistryInner {
                accepting: true,
                connections: HashMap::new(),
            }),
            max_connections,
            idle_timeout,
            stats: RelayStats::default(),
            live_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    /// Look up a live connection.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.lock().connections.get(&id).map(|e| Arc::clone(&e.conn))
    }

    /// Snapshot every live connection, oldest first.
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots: Vec<_> = self
            .lock()
            .connections
            .values()
            .map(|e| e.conn.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// Admit a new connection from `peer_addr`.
    ///
    /// The returned guard removes the record when dropped.
    pub fn try_register(self: &Arc<Self>, peer_addr: SocketAddr) -> Result<ConnectionGuard> {
        let mut inner = self.lock();

        if !inner.accepting {
            self.stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            return Err(ProxyError::ShuttingDown);
        }
        if inner.connections.len() >= self.max_connections {
            self.stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            return Err(ProxyError::AtCapacity {
                max_connections: self.max_connections,
            });
        }

        let conn = Arc::new(Connection::new(peer_addr));
        inner.connections.insert(
            conn.id(),
            Entry {
                conn: Arc::clone(&conn),
                task: None,
            },
        );
        self.live_tx.send_replace(inner.connections.len());
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);

        Ok(ConnectionGuard {
            registry: Arc::clone(self),
            conn,
        })
    }

    /// Remove a connection record and mark it closed.
    ///
    /// The owning task, if any, is not stopped; use [`close`](Self::close)
    /// for that.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.connections.remove(&id).map(|e| e.conn);
            self.live_tx.send_replace(inner.connections.len());
            removed
        };
        if let Some(conn) = &removed {
            self.mark_closed(conn);
        }
        removed
    }

    fn release(&self, conn: &Arc<Connection>) {
        {
            let mut inner = self.lock();
            inner.connections.remove(&conn.id());
            self.live_tx.send_replace(inner.connections.len());
        }
        self.mark_closed(conn);
    }

    fn mark_closed(&self, conn: &Connection) {
        conn.advance(ConnectionState::Closing);
        if conn.advance(ConnectionState::Closed) {
            self.stats
                .connections_closed
                .fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_to_upstream
                .fetch_add(conn.bytes_in(), Ordering::Relaxed);
            self.stats
                .bytes_from_upstream
                .fetch_add(conn.bytes_out(), Ordering::Relaxed);
        }
    }

    /// Drive a connection to completion on its own task.
    ///
    /// The future is raced against the connection's close signal; a close
    /// request drops it, which drops both streams.
    pub fn spawn<F>(self: &Arc<Self>, guard: ConnectionGuard, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<RelaySummary>> + Send + 'static,
    {
        let conn = guard.connection();
        let id = conn.id();
        let registry = Arc::clone(self);
        let span = tracing::info_span!("connection", id = %id, peer = %conn.peer_addr());

        let handle = tokio::spawn(
            async move {
                let guard = guard;
                let outcome = tokio::select! {
                    result = fut => result,
                    reason = conn.closed() => Err(reason.into()),
                };
                conn.advance(ConnectionState::Closing);
                registry.record_outcome(&conn, &outcome);
                drop(guard);
            }
            .instrument(span),
        );

        if let Some(entry) = self.lock().connections.get_mut(&id) {
            entry.task = Some(handle.abort_handle());
        }
        handle
    }

    fn record_outcome(&self, conn: &Connection, outcome: &Result<RelaySummary>) {
        let age_ms = conn.age().as_millis() as u64;
        match outcome {
            Ok(summary) => debug!(
                bytes_in = summary.bytes_in,
                bytes_out = summary.bytes_out,
                age_ms,
                "Connection closed"
            ),
            Err(e) => {
                match e {
                    ProxyError::Handshake(_) => {
                        self.stats.handshake_failed.fetch_add(1, Ordering::Relaxed);
                    }
                    ProxyError::UpstreamConnect { .. } => {
                        self.stats.upstream_failed.fetch_add(1, Ordering::Relaxed);
                    }
                    ProxyError::RelayIo(_) => {
                        self.stats.relay_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    ProxyError::IdleTimeout(_) => {
                        self.stats.idle_closed.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }

                if matches!(e, ProxyError::UpstreamConnect { .. }) {
                    warn!(reason = e.reason_code(), error = %e, age_ms, "Connection failed");
                } else {
                    debug!(
                        reason = e.reason_code(),
                        error = %e,
                        bytes_in = conn.bytes_in(),
                        bytes_out = conn.bytes_out(),
                        age_ms,
                        "Connection closed"
                    );
                }
            }
        }
    }

    /// Ask one connection to close. Returns false if it is not registered.
    pub fn close(&self, id: ConnectionId, reason: CloseReason) -> bool {
        match self.get(id) {
            Some(conn) => {
                conn.request_close(reason);
                true
            }
            None => false,
        }
    }

    /// Ask every registered connection to close. Returns how many were signalled.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let inner = self.lock();
        for entry in inner.connections.values() {
            entry.conn.request_close(reason);
        }
        inner.connections.len()
    }

    /// Signal close to relaying connections idle for at least the timeout.
    pub fn reap_idle(&self) -> usize {
        let Some(idle_timeout) = self.idle_timeout else {
            return 0;
        };

        let inner = self.lock();
        let mut reaped = 0;
        for entry in inner.connections.values() {
            let conn = &entry.conn;
            if conn.state() == ConnectionState::Relaying
                && conn.idle_for() >= idle_timeout
                && conn.request_close(CloseReason::IdleTimeout(idle_timeout))
            {
                debug!(id = %conn.id(), idle_ms = conn.idle_for().as_millis() as u64, "Idle timeout");
                reaped += 1;
            }
        }
        reaped
    }

    /// Periodically close idle connections until shutdown.
    pub async fn run_idle_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(idle_timeout) = self.idle_timeout else {
            return;
        };

        let period = (idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!(
            idle_timeout_ms = idle_timeout.as_millis() as u64,
            period_ms = period.as_millis() as u64,
            "Idle reaper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reap_idle();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Idle reaper shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Stop admitting new connections.
    pub fn stop_accepting(&self) {
        self.lock().accepting = false;
    }

    /// Stop admitting, wait up to `grace` for connections to finish, then
    /// force-close the rest.
    pub async fn shutdown(&self, grace: Duration) -> DrainReport {
        self.stop_accepting();

        let in_flight = self.len();
        if in_flight == 0 {
            return DrainReport::default();
        }

        info!(
            in_flight,
            grace_ms = grace.as_millis() as u64,
            "Draining connections"
        );

        let mut live_rx = self.live_tx.subscribe();
        if timeout(grace, live_rx.wait_for(|n| *n == 0)).await.is_ok() {
            info!(drained = in_flight, "All connections drained");
            return DrainReport {
                in_flight,
                drained: in_flight,
                forced: 0,
            };
        }

        let forced = self.close_all(CloseReason::Shutdown);
        warn!(forced, "Grace period elapsed, closing remaining connections");

        if timeout(FORCE_CLOSE_WAIT, live_rx.wait_for(|n| *n == 0))
            .await
            .is_err()
        {
            self.abort_all();
        }

        DrainReport {
            in_flight,
            drained: in_flight.saturating_sub(forced),
            forced,
        }
    }

    /// Abort every connection task and drop records that have no task.
    ///
    /// Aborting happens outside the lock: an aborted task drops its guard,
    /// which takes the lock again.
    fn abort_all(&self) {
        let mut tasks = Vec::new();
        let mut orphans = Vec::new();
        for (id, entry) in self.lock().connections.iter() {
            match &entry.task {
                Some(task) => tasks.push(task.clone()),
                None => orphans.push(*id),
            }
        }

        for task in tasks {
            task.abort();
        }
        for id in orphans {
            self.remove(id);
        }
    }
}

/// Registration handle for one connection.
///
/// Dropping the guard removes the connection from the registry and marks it
/// closed. This also happens when the owning task panics or is aborted.
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    conn: Arc<Connection>,
}

impl ConnectionGuard {
    pub fn connection(&self) -> Arc<Connection> {
        Arc::clone(&self.conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.release(&self.conn);
    }
}
