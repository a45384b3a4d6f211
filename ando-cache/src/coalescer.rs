use crate::entry::CacheEntry;
use crate::key::CacheKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Duration;

/// A single in-flight upstream fetch that other requests for the same key
/// can ride along with instead of dispatching their own.
pub struct Flight {
    tx: watch::Sender<FlightState>,
}

#[derive(Clone)]
enum FlightState {
    Pending,
    Hit(Arc<CacheEntry>),
    Miss,
}

impl Flight {
    /// Called by the leader once the upstream round-trip completes.
    /// `result` is `None` for anything not worth caching (error, non-cacheable
    /// status): followers waiting on this flight break away immediately.
    pub fn finish(&self, result: Option<CacheEntry>) {
        let state = match result {
            Some(entry) => FlightState::Hit(Arc::new(entry)),
            None => FlightState::Miss,
        };
        let _ = self.tx.send(state);
    }
}

pub enum WaitOutcome {
    Followed(Arc<CacheEntry>),
    LeaderMissed,
    TimedOut,
}

/// Single-flight coalescer keyed by `CacheKey`. The leader for a key owns
/// the `Flight` and is responsible for calling `finish`; followers call
/// `wait` with the route's configured `coalesce_timeout_ms`.
#[derive(Default)]
pub struct Coalescer {
    flights: Mutex<HashMap<CacheKey, Arc<Flight>>>,
}

pub enum StartOutcome {
    Leader(Arc<Flight>),
    Follower(Arc<Flight>),
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join or start a flight for `key`. Exactly one caller per key becomes
    /// the leader; every other concurrent caller for that key becomes a
    /// follower until the leader finishes (or callers break away).
    pub fn start(&self, key: CacheKey) -> StartOutcome {
        let mut flights = self.flights.lock().unwrap();
        if let Some(existing) = flights.get(&key) {
            return StartOutcome::Follower(existing.clone());
        }
        let (tx, _rx) = watch::channel(FlightState::Pending);
        let flight = Arc::new(Flight { tx });
        flights.insert(key, flight.clone());
        StartOutcome::Leader(flight)
    }

    /// The leader must call this once `finish` has been invoked, so the
    /// key's slot is free for the next request that misses the cache.
    pub fn retire(&self, key: &CacheKey) {
        self.flights.lock().unwrap().remove(key);
    }

    /// Follower wait: blocks up to `timeout_ms` for the leader to finish.
    /// A timeout means "break away" — the caller should issue its own
    /// independent upstream request rather than wait further.
    pub async fn wait(flight: &Arc<Flight>, timeout_ms: u64) -> WaitOutcome {
        let mut rx = flight.tx.subscribe();
        if let FlightState::Hit(entry) = &*rx.borrow() {
            return WaitOutcome::Followed(entry.clone());
        }
        let result = tokio::time::timeout(Duration::from_millis(timeout_ms), rx.changed()).await;
        match result {
            Ok(Ok(())) => match &*rx.borrow() {
                FlightState::Hit(entry) => WaitOutcome::Followed(entry.clone()),
                FlightState::Miss | FlightState::Pending => WaitOutcome::LeaderMissed,
            },
            Ok(Err(_)) => WaitOutcome::LeaderMissed,
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Partition;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    fn key() -> CacheKey {
        CacheKey::build("GET", "h", "/p", None, &[], &Partition::Public)
    }

    fn entry() -> CacheEntry {
        CacheEntry {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"hi"),
            stored_at_millis: 0,
            expires_at_millis: 1_000,
        }
    }

    #[test]
    fn first_caller_is_leader_second_is_follower() {
        let coalescer = Coalescer::new();
        let first = coalescer.start(key());
        assert!(matches!(first, StartOutcome::Leader(_)));
        let second = coalescer.start(key());
        assert!(matches!(second, StartOutcome::Follower(_)));
    }

    #[tokio::test]
    async fn follower_receives_leader_result() {
        let coalescer = Coalescer::new();
        let flight = match coalescer.start(key()) {
            StartOutcome::Leader(f) => f,
            _ => unreachable!(),
        };
        let follower_flight = match coalescer.start(key()) {
            StartOutcome::Follower(f) => f,
            _ => unreachable!(),
        };

        flight.finish(Some(entry()));
        match Coalescer::wait(&follower_flight, 1_000).await {
            WaitOutcome::Followed(_) => {}
            _ => panic!("expected follower to receive leader's result"),
        }
    }

    #[tokio::test]
    async fn follower_times_out_and_breaks_away() {
        let coalescer = Coalescer::new();
        let _leader_flight = match coalescer.start(key()) {
            StartOutcome::Leader(f) => f,
            _ => unreachable!(),
        };
        let follower_flight = match coalescer.start(key()) {
            StartOutcome::Follower(f) => f,
            _ => unreachable!(),
        };
        match Coalescer::wait(&follower_flight, 10).await {
            WaitOutcome::TimedOut => {}
            _ => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn leader_miss_propagates_to_followers() {
        let coalescer = Coalescer::new();
        let flight = match coalescer.start(key()) {
            StartOutcome::Leader(f) => f,
            _ => unreachable!(),
        };
        let follower_flight = match coalescer.start(key()) {
            StartOutcome::Follower(f) => f,
            _ => unreachable!(),
        };
        flight.finish(None);
        match Coalescer::wait(&follower_flight, 1_000).await {
            WaitOutcome::LeaderMissed => {}
            _ => panic!("expected leader-missed outcome"),
        }
    }

    #[test]
    fn retire_frees_the_key_for_a_new_leader() {
        let coalescer = Coalescer::new();
        let _ = coalescer.start(key());
        coalescer.retire(&key());
        let next = coalescer.start(key());
        assert!(matches!(next, StartOutcome::Leader(_)));
    }
}
