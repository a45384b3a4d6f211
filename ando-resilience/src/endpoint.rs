use ando_core::config::PassiveHealthConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One backend address inside a pool. Inflight and passive-health state are
/// atomics so the hot path (pick / report) never takes a lock.
pub struct EndpointRuntime {
    pub addr: String,
    inflight: AtomicU64,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    ejection_until_millis: AtomicU64,
    eject_exponent: AtomicU32,
    draining: AtomicBool,
    /// 0 while live; set to the reconcile timestamp once removed from the
    /// desired set, so `reap_drained` knows when the drain timeout elapses.
    removed_at_millis: AtomicU64,
}

impl EndpointRuntime {
    fn new(addr: String) -> Self {
        Self {
            addr,
            inflight: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            ejection_until_millis: AtomicU64::new(0),
            eject_exponent: AtomicU32::new(0),
            draining: AtomicBool::new(false),
            removed_at_millis: AtomicU64::new(0),
        }
    }

    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn is_ejected(&self, now_millis: u64) -> bool {
        self.ejection_until_millis.load(Ordering::Acquire) > now_millis
    }

    fn incr_inflight(&self) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
    }

    fn decr_inflight(&self) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Passive-health success: once `healthy_after_successes` consecutive
    /// successes accumulate, the eject backoff exponent resets so the next
    /// failure starts from `base_eject_ms` again.
    fn report_success(&self, cfg: &PassiveHealthConfig) {
        self.consecutive_failures.store(0, Ordering::Release);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
        if successes >= cfg.healthy_after_successes {
            self.eject_exponent.store(0, Ordering::Release);
        }
    }

    fn report_failure(&self, cfg: &PassiveHealthConfig, now_millis: u64) {
        self.consecutive_successes.store(0, Ordering::Release);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= cfg.unhealthy_after_failures {
            let exponent = self.eject_exponent.fetch_add(1, Ordering::AcqRel);
            let backoff = cfg
                .base_eject_ms
                .saturating_mul(1u64 << exponent.min(20))
                .min(cfg.max_eject_ms);
            self.ejection_until_millis
                .store(now_millis + backoff, Ordering::Release);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickResult {
    pub addr: String,
    pub selected_healthy: bool,
    pub selected_fail_open: bool,
    pub outlier_ignored: bool,
    pub endpoint_ejected: bool,
}

/// The ordered set of endpoints for one pool, plus round-robin cursor.
pub struct PoolRuntime {
    endpoints: DashMap<String, Arc<EndpointRuntime>>,
    order: Mutex<Vec<String>>,
    rr_cursor: AtomicUsize,
    passive_health: PassiveHealthConfig,
}

impl PoolRuntime {
    fn new(passive_health: PassiveHealthConfig) -> Self {
        Self {
            endpoints: DashMap::new(),
            order: Mutex::new(Vec::new()),
            rr_cursor: AtomicUsize::new(0),
            passive_health,
        }
    }

    /// Add any endpoints in `desired` not already present; mark any present
    /// endpoint not in `desired` as draining. Visible to the next `pick`.
    fn reconcile(&self, desired: &[String], now_millis: u64) {
        let desired_set: std::collections::HashSet<&str> =
            desired.iter().map(|s| s.as_str()).collect();

        for addr in desired {
            if !self.endpoints.contains_key(addr) {
                self.endpoints
                    .insert(addr.clone(), Arc::new(EndpointRuntime::new(addr.clone())));
                self.order.lock().unwrap().push(addr.clone());
            } else if let Some(ep) = self.endpoints.get(addr) {
                // Re-added before it was reaped: cancel the drain.
                ep.draining.store(false, Ordering::Release);
                ep.removed_at_millis.store(0, Ordering::Release);
            }
        }

        for entry in self.endpoints.iter() {
            if !desired_set.contains(entry.key().as_str()) && !entry.value().is_draining() {
                entry.value().draining.store(true, Ordering::Release);
                entry
                    .value()
                    .removed_at_millis
                    .store(now_millis, Ordering::Release);
            }
        }
    }

    /// Delete endpoints that have been draining for `drain_timeout_ms` with
    /// zero inflight requests remaining.
    fn reap_drained(&self, drain_timeout_ms: u64, now_millis: u64) {
        let mut to_remove = Vec::new();
        for entry in self.endpoints.iter() {
            let ep = entry.value();
            if !ep.is_draining() {
                continue;
            }
            let removed_at = ep.removed_at_millis.load(Ordering::Acquire);
            if removed_at != 0
                && now_millis.saturating_sub(removed_at) >= drain_timeout_ms
                && ep.inflight() == 0
            {
                to_remove.push(entry.key().clone());
            }
        }
        if to_remove.is_empty() {
            return;
        }
        let mut order = self.order.lock().unwrap();
        order.retain(|a| !to_remove.contains(a));
        for addr in to_remove {
            self.endpoints.remove(&addr);
        }
    }

    /// §4.7 endpoint pick algorithm.
    pub fn pick(
        &self,
        is_outlier_ejected: impl Fn(&str, u64) -> bool,
        max_eject_percent: u32,
        now_millis: u64,
    ) -> Option<PickResult> {
        let order = self.order.lock().unwrap();
        if order.is_empty() {
            return None;
        }

        let non_draining: Vec<&String> = order
            .iter()
            .filter(|a| {
                self.endpoints
                    .get(a.as_str())
                    .map(|e| !e.is_draining())
                    .unwrap_or(false)
            })
            .collect();
        if non_draining.is_empty() {
            return None;
        }

        let healthy: Vec<&String> = non_draining
            .iter()
            .copied()
            .filter(|a| {
                !self
                    .endpoints
                    .get(a.as_str())
                    .map(|e| e.is_ejected(now_millis))
                    .unwrap_or(false)
            })
            .collect();

        let total = non_draining.len();
        let max_ejectable = (total as u32 * max_eject_percent / 100) as usize;

        let outlier_filtered: Vec<&String> = healthy
            .iter()
            .copied()
            .filter(|a| !is_outlier_ejected(a, now_millis))
            .collect();

        let (candidates, outlier_ignored) = if healthy.len() - outlier_filtered.len() > max_ejectable
            && !healthy.is_empty()
        {
            (healthy.clone(), true)
        } else {
            (outlier_filtered, false)
        };

        let (pick_from, selected_healthy, selected_fail_open) = if !candidates.is_empty() {
            (candidates, true, false)
        } else if !non_draining.is_empty() {
            (non_draining.clone(), false, true)
        } else {
            return None;
        };

        let idx = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % pick_from.len();
        let addr = pick_from[idx].clone();
        let endpoint_ejected = self
            .endpoints
            .get(&addr)
            .map(|e| e.is_ejected(now_millis))
            .unwrap_or(false);

        Some(PickResult {
            addr,
            selected_healthy,
            selected_fail_open,
            outlier_ignored,
            endpoint_ejected,
        })
    }

    pub fn incr_inflight(&self, addr: &str) {
        if let Some(e) = self.endpoints.get(addr) {
            e.incr_inflight();
        }
    }

    pub fn decr_inflight(&self, addr: &str) {
        if let Some(e) = self.endpoints.get(addr) {
            e.decr_inflight();
        }
    }

    pub fn report_success(&self, addr: &str) {
        if let Some(e) = self.endpoints.get(addr) {
            e.report_success(&self.passive_health);
        }
    }

    pub fn report_failure(&self, addr: &str, now_millis: u64) {
        if let Some(e) = self.endpoints.get(addr) {
            e.report_failure(&self.passive_health, now_millis);
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_ejected(&self, addr: &str, now_millis: u64) -> bool {
        self.endpoints
            .get(addr)
            .map(|e| e.is_ejected(now_millis))
            .unwrap_or(false)
    }
}

/// Registry of all pools. Keyed by bare pool name — shared across routes
/// that reference the same pool.
#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<String, Arc<PoolRuntime>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create-or-update the named pool's endpoint set. Called by the
    /// snapshot builder, never from the request path.
    pub fn reconcile(
        &self,
        pool_name: &str,
        endpoints: &[String],
        passive_health: PassiveHealthConfig,
        now_millis: u64,
    ) {
        let pool = self
            .pools
            .entry(pool_name.to_string())
            .or_insert_with(|| Arc::new(PoolRuntime::new(passive_health)))
            .clone();
        pool.reconcile(endpoints, now_millis);
    }

    /// Remove every pool not present in `desired_names`.
    pub fn prune(&self, desired_names: &std::collections::HashSet<String>) {
        self.pools.retain(|name, _| desired_names.contains(name));
    }

    pub fn get(&self, pool_name: &str) -> Option<Arc<PoolRuntime>> {
        self.pools.get(pool_name).map(|p| p.clone())
    }

    pub fn reap_all(&self, drain_timeout_ms: u64, now_millis: u64) {
        for entry in self.pools.iter() {
            entry.value().reap_drained(drain_timeout_ms, now_millis);
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PassiveHealthConfig {
        PassiveHealthConfig {
            unhealthy_after_failures: 3,
            healthy_after_successes: 2,
            base_eject_ms: 100,
            max_eject_ms: 1_000,
            drain_timeout_ms: 500,
        }
    }

    #[test]
    fn reconcile_then_pick_round_robins() {
        let registry = PoolRegistry::new();
        registry.reconcile(
            "p1",
            &["a:1".into(), "b:1".into()],
            cfg(),
            0,
        );
        let pool = registry.get("p1").unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let pick = pool.pick(|_, _| false, 50, 0).unwrap();
            seen.insert(pick.addr.to_string());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn removed_endpoint_enters_draining_and_is_not_picked() {
        let registry = PoolRegistry::new();
        registry.reconcile("p1", &["a:1".into(), "b:1".into()], cfg(), 0);
        registry.reconcile("p1", &["a:1".into()], cfg(), 0);
        let pool = registry.get("p1").unwrap();
        for _ in 0..10 {
            let pick = pool.pick(|_, _| false, 50, 0).unwrap();
            assert_eq!(pick.addr, "a:1");
        }
    }

    #[test]
    fn draining_endpoint_reaped_after_timeout_with_zero_inflight() {
        let registry = PoolRegistry::new();
        registry.reconcile("p1", &["a:1".into(), "b:1".into()], cfg(), 0);
        registry.reconcile("p1", &["a:1".into()], cfg(), 0);
        let pool = registry.get("p1").unwrap();
        assert_eq!(pool.endpoint_count(), 2);
        pool.reap_drained(500, 500);
        assert_eq!(pool.endpoint_count(), 1);
    }

    #[test]
    fn passive_failure_ejects_after_threshold() {
        let registry = PoolRegistry::new();
        registry.reconcile("p1", &["a:1".into()], cfg(), 0);
        let pool = registry.get("p1").unwrap();
        for _ in 0..3 {
            pool.report_failure("a:1", 0);
        }
        assert!(pool.is_ejected("a:1", 50));
        assert!(!pool.is_ejected("a:1", 200));
    }

    #[test]
    fn never_eject_all_endpoints_caps_outlier_filtering() {
        let registry = PoolRegistry::new();
        registry.reconcile("p1", &["a:1".into(), "b:1".into()], cfg(), 0);
        let pool = registry.get("p1").unwrap();
        // Both endpoints reported as outlier-ejected by the predicate; the
        // global cap (50%) should bypass ejection rather than return none.
        let pick = pool.pick(|_, _| true, 50, 0).unwrap();
        assert!(pick.outlier_ignored);
    }

    #[test]
    fn prune_removes_pools_not_desired() {
        let registry = PoolRegistry::new();
        registry.reconcile("p1", &["a:1".into()], cfg(), 0);
        registry.reconcile("p2", &["b:1".into()], cfg(), 0);
        let desired: std::collections::HashSet<String> = ["p1".to_string()].into_iter().collect();
        registry.prune(&desired);
        assert!(registry.get("p1").is_some());
        assert!(registry.get("p2").is_none());
    }
}
