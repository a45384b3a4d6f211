use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterBreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-filter circuit breaker: plain consecutive-failure trip, distinct
/// from `ando_resilience::breaker::Breaker`'s rolling failure-rate window.
/// Grounded directly in `ninelives::circuit_breaker`'s simpler threshold
/// model, since a single external plugin call has no meaningful "rate"
/// concept at the volume a single route sees.
pub struct FilterBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    open_until_millis: AtomicU64,
    half_open_inflight: AtomicU32,
    failure_threshold: u32,
    open_duration_ms: u64,
    half_open_max_probes: u32,
}

impl FilterBreaker {
    pub fn new(failure_threshold: u32, open_duration_ms: u64, half_open_max_probes: u32) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            open_until_millis: AtomicU64::new(0),
            half_open_inflight: AtomicU32::new(0),
            failure_threshold,
            open_duration_ms,
            half_open_max_probes,
        }
    }

    pub fn state(&self) -> FilterBreakerState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => FilterBreakerState::Open,
            STATE_HALF_OPEN => FilterBreakerState::HalfOpen,
            _ => FilterBreakerState::Closed,
        }
    }

    pub fn admit(&self, now_millis: u64) -> bool {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    if now_millis >= self.open_until_millis.load(Ordering::Acquire) {
                        if self
                            .state
                            .compare_exchange(
                                STATE_OPEN,
                                STATE_HALF_OPEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            self.half_open_inflight.store(0, Ordering::Release);
                        }
                        continue;
                    }
                    return false;
                }
                STATE_HALF_OPEN => {
                    let inflight = self.half_open_inflight.fetch_add(1, Ordering::AcqRel);
                    if inflight >= self.half_open_max_probes {
                        self.half_open_inflight.fetch_sub(1, Ordering::AcqRel);
                        return false;
                    }
                    return true;
                }
                _ => return true,
            }
        }
    }

    pub fn on_success(&self) {
        if self
            .state
            .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.consecutive_failures.store(0, Ordering::Release);
            return;
        }
        self.consecutive_failures.store(0, Ordering::Release);
    }

    pub fn on_failure(&self, now_millis: u64) {
        if self.state.load(Ordering::Acquire) == STATE_HALF_OPEN {
            self.trip(now_millis);
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.failure_threshold {
            self.trip(now_millis);
        }
    }

    fn trip(&self, now_millis: u64) {
        self.state.store(STATE_OPEN, Ordering::Release);
        self.open_until_millis
            .store(now_millis + self.open_duration_ms, Ordering::Release);
    }
}

/// Registry of per-filter breakers, keyed by `route_id::filter_name`.
#[derive(Default)]
pub struct FilterBreakerRegistry {
    breakers: DashMap<String, Arc<FilterBreaker>>,
}

impl FilterBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconcile(&self, key: &str, failure_threshold: u32, open_duration_ms: u64, half_open_max_probes: u32) {
        self.breakers.entry(key.to_string()).or_insert_with(|| {
            Arc::new(FilterBreaker::new(failure_threshold, open_duration_ms, half_open_max_probes))
        });
    }

    pub fn prune(&self, desired_keys: &std::collections::HashSet<String>) {
        self.breakers.retain(|k, _| desired_keys.contains(k));
    }

    pub fn get(&self, key: &str) -> Option<Arc<FilterBreaker>> {
        self.breakers.get(key).map(|b| b.clone())
    }
}
