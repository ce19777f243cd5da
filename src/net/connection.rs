//! Connection state and lifecycle tracking.
//!
//! # Responsibilities
//! - Own the transport handle for the lifetime of one socket
//! - Hold the shared flags (aborted, writable-ended, errored) and byte counters
//! - Generate unique connection IDs for tracing
//! - Track live connections for the listener

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::AdapterError;
use crate::transport::Transport;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Adapter state machine.
///
/// ```text
/// Opening → { ReadOnly | WriteOnly | Open } → { Ended | Aborted }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, protocol not attached yet.
    Opening,
    /// Only the inbound side is in use.
    ReadOnly,
    /// Only the outbound side is in use.
    WriteOnly,
    /// Both sides in use.
    Open,
    /// Final write fully flushed.
    Ended,
    /// Torn down before a clean end.
    Aborted,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Ended | ConnectionState::Aborted)
    }

    pub(crate) fn attached(readable: bool, writable: bool) -> Self {
        match (readable, writable) {
            (true, true) => ConnectionState::Open,
            (true, false) => ConnectionState::ReadOnly,
            (false, true) => ConnectionState::WriteOnly,
            (false, false) => ConnectionState::Opening,
        }
    }
}

/// One network socket.
///
/// The transport handle lives here and nowhere else; once `aborted` is set
/// it is never touched again.
pub struct Connection {
    id: ConnectionId,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) aborted: bool,
    pub(crate) writable_ended: bool,
    pub(crate) errored: Option<AdapterError>,
    pub(crate) bytes_read: u64,
    pub(crate) bytes_written: u64,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            id: ConnectionId::new(),
            transport,
            aborted: false,
            writable_ended: false,
            errored: None,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("aborted", &self.aborted)
            .field("writable_ended", &self.writable_ended)
            .field("bytes_read", &self.bytes_read)
            .field("bytes_written", &self.bytes_written)
            .finish_non_exhaustive()
    }
}

/// Tracks live connections for a listener.
///
/// A watch channel carries the current count so callers can wait for it to
/// reach zero.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active_tx: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            active_tx: Arc::new(tx),
        }
    }

    /// Record a new live connection. Returns a guard that decrements on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        self.active_tx.send_modify(|n| *n += 1);
        crate::observability::metrics::set_active_connections(self.active_count());
        ConnectionGuard {
            active_tx: Arc::clone(&self.active_tx),
            id,
        }
    }

    /// Get current live connection count.
    pub fn active_count(&self) -> u64 {
        *self.active_tx.borrow()
    }

    /// Wait until every tracked connection has been released.
    pub async fn wait_idle(&self) {
        let mut rx = self.active_tx.subscribe();
        // Sender is held by self, so this only errs if it was dropped.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements the live count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_tx: Arc<watch::Sender<u64>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_tx.send_modify(|n| *n = n.saturating_sub(1));
        crate::observability::metrics::set_active_connections(*self.active_tx.borrow());
        tracing::trace!(connection_id = %self.id, "Connection released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn state_attachment() {
        assert_eq!(ConnectionState::attached(true, true), ConnectionState::Open);
        assert_eq!(ConnectionState::attached(true, false), ConnectionState::ReadOnly);
        assert_eq!(ConnectionState::attached(false, true), ConnectionState::WriteOnly);
        assert!(ConnectionState::Aborted.is_terminal());
        assert!(!ConnectionState::Open.is_terminal());
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn wait_idle_returns_after_release() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track(ConnectionId::new());
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        drop(guard);
        waiter.await.unwrap();
    }
}
