use ando_core::config::OutlierConfig;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct Sample {
    at_millis: u64,
    failed: bool,
}

/// Outlier-detection state for one endpoint within one pool. Distinct from
/// `endpoint::EndpointRuntime`'s passive-health backoff: this tracks error
/// rate and latency over a rolling window, feeding the pick algorithm's
/// outlier-ejection predicate rather than gating requests directly.
struct OutlierTracker {
    consecutive_failures: AtomicU32,
    window: Mutex<VecDeque<Sample>>,
    latencies: Mutex<VecDeque<u64>>,
    ejected_until_millis: AtomicU64,
    eject_exponent: AtomicU32,
    cfg: OutlierConfig,
}

impl OutlierTracker {
    fn new(cfg: OutlierConfig) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            window: Mutex::new(VecDeque::new()),
            latencies: Mutex::new(VecDeque::new()),
            ejected_until_millis: AtomicU64::new(0),
            eject_exponent: AtomicU32::new(0),
            cfg,
        }
    }

    fn is_ejected(&self, now_millis: u64) -> bool {
        self.ejected_until_millis.load(Ordering::Acquire) > now_millis
    }

    fn record(&self, failed: bool, latency_ms: u64, now_millis: u64) {
        {
            let mut latencies = self.latencies.lock().unwrap();
            latencies.push_back(latency_ms);
            while latencies.len() > self.cfg.latency_window_size {
                latencies.pop_front();
            }
        }

        let consecutive = if failed {
            self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.consecutive_failures.store(0, Ordering::Release);
            0
        };

        let slow = latency_ms >= self.cfg.latency_threshold_ms;
        {
            let mut window = self.window.lock().unwrap();
            window.push_back(Sample { at_millis: now_millis, failed: failed || slow });
            while window.len() > self.cfg.error_rate_min_requests.max(32) as usize * 4 {
                window.pop_front();
            }
        }

        if consecutive >= self.cfg.consecutive_failures || self.error_rate_exceeded() {
            self.eject(now_millis);
        }
    }

    fn error_rate_exceeded(&self) -> bool {
        let window = self.window.lock().unwrap();
        let relevant: Vec<&Sample> = window.iter().collect();
        if relevant.len() < self.cfg.error_rate_min_requests as usize {
            return false;
        }
        let bad = relevant.iter().filter(|s| s.failed).count();
        let rate = bad * 100 / relevant.len();
        rate as u32 >= self.cfg.error_rate_percent
    }

    fn eject(&self, now_millis: u64) {
        let exponent = self.eject_exponent.fetch_add(1, Ordering::AcqRel);
        let backoff = self
            .cfg
            .base_eject_ms
            .saturating_mul(1u64 << exponent.min(20))
            .min(self.cfg.max_eject_ms);
        self.ejected_until_millis
            .store(now_millis + backoff, Ordering::Release);
    }
}

/// Registry of outlier trackers, keyed by `(pool_name, addr)`.
#[derive(Default)]
pub struct OutlierRegistry {
    trackers: DashMap<(String, String), Arc<OutlierTracker>>,
    max_eject_percent: DashMap<String, u32>,
}

impl OutlierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconcile(&self, pool_name: &str, addr: &str, cfg: OutlierConfig) {
        self.max_eject_percent
            .insert(pool_name.to_string(), cfg.max_eject_percent);
        self.trackers
            .entry((pool_name.to_string(), addr.to_string()))
            .or_insert_with(|| Arc::new(OutlierTracker::new(cfg)));
    }

    pub fn prune(&self, pool_name: &str, desired_addrs: &std::collections::HashSet<String>) {
        self.trackers
            .retain(|(p, a), _| p != pool_name || desired_addrs.contains(a));
    }

    pub fn prune_pools(&self, desired_pools: &std::collections::HashSet<String>) {
        self.trackers.retain(|(p, _), _| desired_pools.contains(p));
        self.max_eject_percent.retain(|p, _| desired_pools.contains(p));
    }

    pub fn record(&self, pool_name: &str, addr: &str, failed: bool, latency_ms: u64, now_millis: u64) {
        if let Some(t) = self
            .trackers
            .get(&(pool_name.to_string(), addr.to_string()))
        {
            t.record(failed, latency_ms, now_millis);
        }
    }

    pub fn is_ejected(&self, pool_name: &str, addr: &str, now_millis: u64) -> bool {
        self.trackers
            .get(&(pool_name.to_string(), addr.to_string()))
            .map(|t| t.is_ejected(now_millis))
            .unwrap_or(false)
    }

    pub fn max_eject_percent_for(&self, pool_name: &str) -> u32 {
        self.max_eject_percent
            .get(pool_name)
            .map(|v| *v)
            .unwrap_or(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> OutlierConfig {
        OutlierConfig {
            consecutive_failures: 3,
            error_rate_percent: 50,
            error_rate_min_requests: 4,
            latency_window_size: 10,
            latency_threshold_ms: 1_000,
            base_eject_ms: 100,
            max_eject_ms: 1_000,
            max_eject_percent: 34,
        }
    }

    #[test]
    fn consecutive_failures_trip_ejection() {
        let reg = OutlierRegistry::new();
        reg.reconcile("p1", "a:1", cfg());
        for _ in 0..3 {
            reg.record("p1", "a:1", true, 10, 0);
        }
        assert!(reg.is_ejected("p1", "a:1", 50));
        assert!(!reg.is_ejected("p1", "a:1", 5_000));
    }

    #[test]
    fn error_rate_trips_ejection_once_min_requests_met() {
        let reg = OutlierRegistry::new();
        reg.reconcile("p1", "a:1", cfg());
        reg.record("p1", "a:1", true, 10, 0);
        reg.record("p1", "a:1", false, 10, 0);
        reg.record("p1", "a:1", true, 10, 0);
        assert!(!reg.is_ejected("p1", "a:1", 0));
        reg.record("p1", "a:1", false, 10, 0);
        assert!(reg.is_ejected("p1", "a:1", 0));
    }

    #[test]
    fn healthy_endpoint_never_ejected() {
        let reg = OutlierRegistry::new();
        reg.reconcile("p1", "a:1", cfg());
        for _ in 0..20 {
            reg.record("p1", "a:1", false, 10, 0);
        }
        assert!(!reg.is_ejected("p1", "a:1", 0));
    }

    #[test]
    fn unknown_endpoint_defaults_to_not_ejected() {
        let reg = OutlierRegistry::new();
        assert!(!reg.is_ejected("missing", "a:1", 0));
    }

    #[test]
    fn max_eject_percent_defaults_to_100_when_unknown() {
        let reg = OutlierRegistry::new();
        assert_eq!(reg.max_eject_percent_for("missing"), 100);
    }
}
