use ando_core::config::BreakerConfig;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for BreakerState {
    fn from(v: u8) -> Self {
        match v {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

struct Outcome {
    at_millis: u64,
    failed: bool,
}

/// Per route::pool breaker. Tracks a rolling window of outcomes to compute
/// failure rate, and the half-open probe budget.
pub struct Breaker {
    state: AtomicU8,
    open_until_millis: AtomicU64,
    half_open_probes_inflight: AtomicU64,
    window: Mutex<VecDeque<Outcome>>,
    cfg: BreakerConfig,
}

impl Breaker {
    fn new(cfg: BreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            open_until_millis: AtomicU64::new(0),
            half_open_probes_inflight: AtomicU64::new(0),
            window: Mutex::new(VecDeque::new()),
            cfg,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Call before dispatching a request. Returns true if the request may
    /// proceed; false means short-circuit with `circuit_open`.
    pub fn admit(&self, now_millis: u64) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            match current {
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
                            self.half_open_probes_inflight.store(0, Ordering::Release);
                        }
                        continue;
                    }
                    return false;
                }
                STATE_HALF_OPEN => {
                    let inflight = self.half_open_probes_inflight.fetch_add(1, Ordering::AcqRel);
                    if inflight >= self.cfg.half_open_max_probes as u64 {
                        self.half_open_probes_inflight.fetch_sub(1, Ordering::AcqRel);
                        return false;
                    }
                    return true;
                }
                _ => return true,
            }
        }
    }

    /// Optimistic half-open close: the first successful probe closes the
    /// breaker immediately rather than waiting for a quota of successes.
    pub fn on_success(&self, now_millis: u64) {
        let current = self.state.load(Ordering::Acquire);
        if current == STATE_HALF_OPEN {
            if self
                .state
                .compare_exchange(
                    STATE_HALF_OPEN,
                    STATE_CLOSED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.window.lock().unwrap().clear();
            }
            return;
        }
        self.record(now_millis, false);
    }

    pub fn on_failure(&self, now_millis: u64) {
        let current = self.state.load(Ordering::Acquire);
        if current == STATE_HALF_OPEN {
            self.trip(now_millis);
            return;
        }
        self.record(now_millis, true);
        if self.failure_rate_exceeded(now_millis) {
            self.trip(now_millis);
        }
    }

    fn trip(&self, now_millis: u64) {
        self.state.store(STATE_OPEN, Ordering::Release);
        self.open_until_millis
            .store(now_millis + self.cfg.open_duration_ms, Ordering::Release);
        self.window.lock().unwrap().clear();
    }

    fn record(&self, now_millis: u64, failed: bool) {
        let mut window = self.window.lock().unwrap();
        window.push_back(Outcome { at_millis: now_millis, failed });
        let cutoff = now_millis.saturating_sub(self.cfg.evaluation_window_ms);
        while window.front().map(|o| o.at_millis < cutoff).unwrap_or(false) {
            window.pop_front();
        }
    }

    fn failure_rate_exceeded(&self, now_millis: u64) -> bool {
        let window = self.window.lock().unwrap();
        let cutoff = now_millis.saturating_sub(self.cfg.evaluation_window_ms);
        let relevant: Vec<&Outcome> = window.iter().filter(|o| o.at_millis >= cutoff).collect();
        if relevant.len() < self.cfg.min_requests as usize {
            return false;
        }
        let failures = relevant.iter().filter(|o| o.failed).count();
        let rate = failures * 100 / relevant.len();
        rate as u32 >= self.cfg.failure_threshold_percent
    }
}

/// Registry of breakers keyed by `route_id::pool_name` (see `ando_core::pool::PoolKey`).
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<Breaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconcile(&self, key: &str, cfg: BreakerConfig) {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Breaker::new(cfg)));
    }

    pub fn prune(&self, desired_keys: &std::collections::HashSet<String>) {
        self.breakers.retain(|k, _| desired_keys.contains(k));
    }

    pub fn get(&self, key: &str) -> Option<Arc<Breaker>> {
        self.breakers.get(key).map(|b| b.clone())
    }

    pub fn admit(&self, key: &str, now_millis: u64) -> bool {
        self.get(key).map(|b| b.admit(now_millis)).unwrap_or(true)
    }

    pub fn on_success(&self, key: &str, now_millis: u64) {
        if let Some(b) = self.get(key) {
            b.on_success(now_millis);
        }
    }

    pub fn on_failure(&self, key: &str, now_millis: u64) {
        if let Some(b) = self.get(key) {
            b.on_failure(now_millis);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BreakerConfig {
        BreakerConfig {
            failure_threshold_percent: 50,
            min_requests: 4,
            evaluation_window_ms: 10_000,
            open_duration_ms: 1_000,
            half_open_max_probes: 1,
        }
    }

    #[test]
    fn closed_stays_closed_under_threshold() {
        let b = Breaker::new(cfg());
        b.on_failure(0);
        b.on_success(0);
        b.on_failure(0);
        b.on_success(0);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn trips_open_once_failure_rate_exceeds_threshold() {
        let b = Breaker::new(cfg());
        for _ in 0..4 {
            b.on_failure(0);
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.admit(0));
    }

    #[test]
    fn transitions_to_half_open_after_open_duration() {
        let b = Breaker::new(cfg());
        for _ in 0..4 {
            b.on_failure(0);
        }
        assert!(!b.admit(500));
        assert!(b.admit(1_000));
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn first_half_open_success_closes_immediately() {
        let b = Breaker::new(cfg());
        for _ in 0..4 {
            b.on_failure(0);
        }
        assert!(b.admit(1_000));
        b.on_success(1_000);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let b = Breaker::new(cfg());
        for _ in 0..4 {
            b.on_failure(0);
        }
        assert!(b.admit(1_000));
        b.on_failure(1_000);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn half_open_probe_budget_limits_concurrent_admits() {
        let b = Breaker::new(cfg());
        for _ in 0..4 {
            b.on_failure(0);
        }
        assert!(b.admit(1_000));
        assert!(!b.admit(1_000));
    }

    #[test]
    fn registry_unknown_key_admits_by_default() {
        let reg = BreakerRegistry::new();
        assert!(reg.admit("route::pool", 0));
    }
}
