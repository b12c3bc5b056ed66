//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count live client connections and upgrade bridges
//! - Let shutdown wait (bounded) until everything has drained
//! - Keep a connection's slot held for as long as its socket is in use,
//!   including after an upgrade hands it to a bridge

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::net::listener::ConnectionPermit;
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
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

/// Counts live units of work (client connections, bridges).
///
/// Cloning shares the same counter.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    active: AtomicU64,
    drained: Notify,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active unit. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
            id: ConnectionId::new(),
        }
    }

    /// Get current active count.
    pub fn active_count(&self) -> u64 {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until the count reaches zero or `limit` elapses.
    ///
    /// Returns `true` if everything drained in time.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }
}

/// Guard that tracks a unit's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    inner: Arc<TrackerInner>,
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
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// Everything a client socket holds while it is open: its slot under the
/// connection limit and its place in the drain count.
#[derive(Debug)]
pub struct ConnectionLease {
    _permit: ConnectionPermit,
    guard: ConnectionGuard,
    established: bool,
}

impl ConnectionLease {
    pub fn new(permit: ConnectionPermit, guard: ConnectionGuard) -> Self {
        Self {
            _permit: permit,
            guard,
            established: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.guard.id()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.established {
            metrics::connection_closed();
        }
    }
}

/// A lease that can change owners.
///
/// The connection task and the request it is serving share one slot; an
/// upgrade takes the lease out so the bridge keeps it past the end of the
/// HTTP connection. Whoever holds the last reference releases it.
#[derive(Debug, Clone)]
pub struct SharedLease {
    slot: Arc<Mutex<Option<ConnectionLease>>>,
}

impl SharedLease {
    pub fn new(lease: ConnectionLease) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(lease))),
        }
    }

    /// Mark the connection as established (TLS done) for the gauges.
    pub fn establish(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lease) = slot.as_mut() {
            if !lease.established {
                lease.established = true;
                metrics::connection_opened();
            }
        }
    }

    /// Move the lease out, leaving the slot empty.
    pub fn take(&self) -> Option<ConnectionLease> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
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
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track();
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.clone().track();
        assert_eq!(tracker.active_count(), 2);
        assert_ne!(guard1.id(), guard2.id());

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn wait_idle_returns_when_drained() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });

        assert!(tracker.wait_idle(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn taken_lease_outlives_its_connection() {
        let limit = Arc::new(tokio::sync::Semaphore::new(1));
        let tracker = ConnectionTracker::new();
        let permit = ConnectionPermit::new(limit.clone().try_acquire_owned().unwrap());
        let shared = SharedLease::new(ConnectionLease::new(permit, tracker.track()));

        let for_request = shared.clone();
        let bridged = for_request.take().unwrap();
        drop(for_request);
        drop(shared);

        assert_eq!(limit.available_permits(), 0);
        assert_eq!(tracker.active_count(), 1);

        drop(bridged);
        assert_eq!(limit.available_permits(), 1);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn untaken_lease_is_released_with_last_reference() {
        let limit = Arc::new(tokio::sync::Semaphore::new(1));
        let tracker = ConnectionTracker::new();
        let permit = ConnectionPermit::new(limit.clone().try_acquire_owned().unwrap());
        let shared = SharedLease::new(ConnectionLease::new(permit, tracker.track()));
        let clone = shared.clone();

        drop(shared);
        assert_eq!(limit.available_permits(), 0);
        drop(clone);
        assert_eq!(limit.available_permits(), 1);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn wait_idle_gives_up_after_limit() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.track();

        assert!(!tracker.wait_idle(Duration::from_millis(20)).await);
    }
}
