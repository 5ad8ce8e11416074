//! Per-connection record: identity, lifecycle state and byte counters.
//!
//! The record is shared between the registry (which owns it) and the task
//! relaying the connection. Streams never live here; they are owned by the
//! task, so dropping the task releases both sockets.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use ulid::Ulid;

use crate::error::ProxyError;

/// Opaque connection identifier, formatted as `conn_{ulid}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(Ulid);

impl ConnectionId {
    /// The prefix for connection IDs.
    pub const PREFIX: &'static str = "conn";

    /// Creates a new ID with a fresh ULID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

/// Errors from parsing a [`ConnectionId`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionIdError {
    #[error("invalid connection id prefix: expected 'conn', got '{0}'")]
    InvalidPrefix(String),

    #[error("connection id missing underscore separator")]
    MissingSeparator,

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl FromStr for ConnectionId {
    type Err = ConnectionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((prefix, ulid)) = s.split_once('_') else {
            return Err(ConnectionIdError::MissingSeparator);
        };
        if prefix != Self::PREFIX {
            return Err(ConnectionIdError::InvalidPrefix(prefix.to_string()));
        }
        ulid.parse::<Ulid>()
            .map(Self)
            .map_err(|e| ConnectionIdError::InvalidUlid(e.to_string()))
    }
}

/// Lifecycle state of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted; inbound handshake or upstream connect in progress.
    Connecting = 0,
    /// Both streams established, bytes flowing.
    Relaying = 1,
    /// Tear-down started; streams are being released.
    Closing = 2,
    /// Terminal. No stream handles remain.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Relaying,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a connection was asked to close from outside its own task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No traffic for the configured idle window.
    IdleTimeout(Duration),
    /// Process shutdown.
    Shutdown,
}

impl From<CloseReason> for ProxyError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::IdleTimeout(window) => ProxyError::IdleTimeout(window),
            CloseReason::Shutdown => ProxyError::ShutdownRequested,
        }
    }
}

/// Shared record for one client connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    created_at: DateTime<Utc>,
    started: Instant,
    state: AtomicU8,
    /// Bytes read from the client and written upstream.
    bytes_in: AtomicU64,
    /// Bytes read from upstream and written to the client.
    bytes_out: AtomicU64,
    /// Milliseconds since `started` at the last byte-count change.
    last_activity_ms: AtomicU64,
    close_tx: watch::Sender<Option<CloseReason>>,
}

impl Connection {
    /// Create a record in the `Connecting` state.
    pub fn new(peer_addr: SocketAddr) -> Self {
        let (close_tx, _) = watch::channel(None);
        Self {
            id: ConnectionId::new(),
            peer_addr,
            created_at: Utc::now(),
            started: Instant::now(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            close_tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` if it is strictly later than the current state.
    ///
    /// Returns `false` (and leaves the state alone) for backward or repeated
    /// transitions. Entering `Relaying` restarts the idle clock.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let advanced = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (next as u8 > current).then_some(next as u8)
            })
            .is_ok();
        if advanced && next == ConnectionState::Relaying {
            self.touch();
        }
        advanced
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Count bytes relayed client to upstream.
    pub fn record_inbound(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Count bytes relayed upstream to client.
    pub fn record_outbound(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the byte counters last changed (or since creation).
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Ask the connection task to stop. The first reason wins.
    pub fn request_close(&self, reason: CloseReason) -> bool {
        self.close_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    /// The close reason, if one was requested.
    pub fn close_requested(&self) -> Option<CloseReason> {
        *self.close_tx.borrow()
    }

    /// Resolve once a close has been requested.
    pub(crate) async fn closed(&self) -> CloseReason {
        let mut rx = self.close_tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(CloseReason::Shutdown),
            // Unreachable while `self` holds the sender.
            Err(_) => CloseReason::Shutdown,
        };
        reason
    }

    /// Point-in-time copy for inspection.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            peer_addr: self.peer_addr,
            state: self.state(),
            created_at: self.created_at,
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
            idle_for: self.idle_for(),
        }
    }
}

/// Copy of a connection's observable fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub idle_for: Duration,
}
