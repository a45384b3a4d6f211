use ando_core::config::{AutoDrainConfig, OverloadLimiterConfig, TrafficPlanConfig};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Stable,
    Canary,
}

fn fnv1a64(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Per-process xorshift64 generator, used when a route's traffic plan has
/// no cohort key to hash: every un-keyed request still needs a draw, but it
/// doesn't need to be cryptographically random.
struct Xorshift64 {
    state: AtomicU64,
}

impl Xorshift64 {
    fn seeded() -> Self {
        let seed = rand::random::<u64>() | 1;
        Self { state: AtomicU64::new(seed) }
    }

    fn next(&self) -> u64 {
        let mut x = self.state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state.store(x, Ordering::Relaxed);
        x
    }
}

struct Split {
    stable_weight: u32,
    canary_weight: u32,
}

impl Split {
    fn choose(&self, value: u64) -> Variant {
        if self.canary_weight == 0 {
            return Variant::Stable;
        }
        let total = (self.stable_weight as u64) + (self.canary_weight as u64);
        if total == 0 {
            return Variant::Stable;
        }
        if value % total < self.stable_weight as u64 {
            Variant::Stable
        } else {
            Variant::Canary
        }
    }
}

struct WindowCounts {
    window_started_at: u64,
    stable_total: u64,
    stable_failed: u64,
    canary_total: u64,
    canary_failed: u64,
}

impl WindowCounts {
    fn fresh(now_millis: u64) -> Self {
        Self {
            window_started_at: now_millis,
            stable_total: 0,
            stable_failed: 0,
            canary_total: 0,
            canary_failed: 0,
        }
    }
}

struct AutoDrainState {
    cfg: AutoDrainConfig,
    counts: Mutex<WindowCounts>,
    drained_until_millis: AtomicU64,
}

impl AutoDrainState {
    fn new(cfg: AutoDrainConfig, now_millis: u64) -> Self {
        Self {
            cfg,
            counts: Mutex::new(WindowCounts::fresh(now_millis)),
            drained_until_millis: AtomicU64::new(0),
        }
    }

    fn record(&self, variant: Variant, failed: bool) {
        let mut counts = self.counts.lock().unwrap();
        match variant {
            Variant::Stable => {
                counts.stable_total += 1;
                if failed {
                    counts.stable_failed += 1;
                }
            }
            Variant::Canary => {
                counts.canary_total += 1;
                if failed {
                    counts.canary_failed += 1;
                }
            }
        }
    }

    fn is_drained(&self, now_millis: u64) -> bool {
        self.drained_until_millis.load(Ordering::Acquire) > now_millis
    }

    /// Evaluate the current window and roll it over. Intended to be driven
    /// by a periodic caller (the server's background ticker), not inline on
    /// the request path.
    fn tick(&self, now_millis: u64) {
        let mut counts = self.counts.lock().unwrap();
        if now_millis.saturating_sub(counts.window_started_at) < self.cfg.window_ms {
            return;
        }

        if counts.stable_total + counts.canary_total >= self.cfg.min_requests
            && counts.canary_total > 0
        {
            let stable_rate = if counts.stable_total > 0 {
                counts.stable_failed as f64 / counts.stable_total as f64
            } else {
                0.0
            };
            let canary_rate = counts.canary_failed as f64 / counts.canary_total as f64;

            if canary_rate > stable_rate * self.cfg.multiplier && canary_rate > 0.0 {
                self.drained_until_millis
                    .store(now_millis + self.cfg.cooloff_ms, Ordering::Release);
            }
        }

        *counts = WindowCounts::fresh(now_millis);
    }
}

/// Fixed-concurrency admission control with an optional bounded wait queue.
/// Exceeding the queue (or timing out in it) yields `overloaded`.
pub struct OverloadLimiter {
    semaphore: Arc<Semaphore>,
    max_queue: usize,
    queue_timeout_ms: u64,
    queued: AtomicUsize,
}

impl OverloadLimiter {
    fn new(cfg: &OverloadLimiterConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(cfg.max_inflight)),
            max_queue: cfg.max_queue,
            queue_timeout_ms: cfg.queue_timeout_ms,
            queued: AtomicUsize::new(0),
        }
    }

    /// Returns a permit on admission, or `None` if the request should be
    /// rejected as `overloaded` (queue full, or queue wait timed out).
    pub async fn acquire(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        if self.semaphore.available_permits() > 0 {
            return self.semaphore.clone().try_acquire_owned().ok();
        }
        if self.queued.load(Ordering::Acquire) >= self.max_queue {
            return None;
        }
        self.queued.fetch_add(1, Ordering::AcqRel);
        let result = tokio::time::timeout(
            Duration::from_millis(self.queue_timeout_ms),
            self.semaphore.clone().acquire_owned(),
        )
        .await;
        self.queued.fetch_sub(1, Ordering::AcqRel);
        match result {
            Ok(Ok(permit)) => Some(permit),
            _ => None,
        }
    }
}

/// One named traffic plan: stable/canary split, optional sticky cohort key,
/// optional overload limiter, optional autodrain.
pub struct TrafficPlan {
    split: Split,
    cohort_sticky: bool,
    cohort_header: Option<String>,
    rng: Xorshift64,
    overload: Option<OverloadLimiter>,
    autodrain: Option<AutoDrainState>,
}

impl TrafficPlan {
    fn new(cfg: &TrafficPlanConfig, now_millis: u64) -> Self {
        Self {
            split: Split {
                stable_weight: cfg.stable_weight,
                canary_weight: cfg.canary_weight,
            },
            cohort_sticky: cfg.cohort.is_some(),
            cohort_header: cfg.cohort.clone(),
            rng: Xorshift64::seeded(),
            overload: cfg.overload.as_ref().map(OverloadLimiter::new),
            autodrain: cfg
                .autodrain
                .clone()
                .map(|c| AutoDrainState::new(c, now_millis)),
        }
    }

    /// Header name whose value is used as the sticky cohort key, if this
    /// plan is configured for one. The handler reads this to decide what to
    /// extract from the inbound request before calling `choose`.
    pub fn cohort_header(&self) -> Option<&str> {
        self.cohort_header.as_deref()
    }

    /// `cohort_key` is the already-extracted value of the configured cohort
    /// header (or any stable per-request identity); `None` when the plan
    /// has no cohort configured, in which case selection is unsticky.
    pub fn choose(&self, cohort_key: Option<&str>, now_millis: u64) -> Variant {
        if self
            .autodrain
            .as_ref()
            .map(|a| a.is_drained(now_millis))
            .unwrap_or(false)
        {
            return Variant::Stable;
        }
        let value = match (self.cohort_sticky, cohort_key) {
            (true, Some(key)) => fnv1a64(key),
            _ => self.rng.next(),
        };
        self.split.choose(value)
    }

    pub fn record_outcome(&self, variant: Variant, failed: bool) {
        if let Some(autodrain) = &self.autodrain {
            autodrain.record(variant, failed);
        }
    }

    pub fn tick(&self, now_millis: u64) {
        if let Some(autodrain) = &self.autodrain {
            autodrain.tick(now_millis);
        }
    }

    pub async fn admit(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        match &self.overload {
            Some(limiter) => limiter.acquire().await,
            None => None,
        }
    }

    pub fn has_overload_limiter(&self) -> bool {
        self.overload.is_some()
    }
}

/// Registry of traffic plans, keyed by the name routes reference.
#[derive(Default)]
pub struct TrafficRegistry {
    plans: DashMap<String, Arc<TrafficPlan>>,
}

impl TrafficRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconcile(&self, name: &str, cfg: &TrafficPlanConfig, now_millis: u64) {
        self.plans
            .insert(name.to_string(), Arc::new(TrafficPlan::new(cfg, now_millis)));
    }

    pub fn prune(&self, desired_names: &std::collections::HashSet<String>) {
        self.plans.retain(|k, _| desired_names.contains(k));
    }

    pub fn get(&self, name: &str) -> Option<Arc<TrafficPlan>> {
        self.plans.get(name).map(|p| p.clone())
    }

    pub fn tick_all(&self, now_millis: u64) {
        for entry in self.plans.iter() {
            entry.value().tick(now_millis);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_cfg(stable: u32, canary: u32) -> TrafficPlanConfig {
        TrafficPlanConfig {
            stable_weight: stable,
            canary_weight: canary,
            cohort: None,
            overload: None,
            autodrain: None,
        }
    }

    #[test]
    fn zero_canary_weight_always_picks_stable() {
        let plan = TrafficPlan::new(&plan_cfg(100, 0), 0);
        for _ in 0..20 {
            assert_eq!(plan.choose(None, 0), Variant::Stable);
        }
    }

    #[test]
    fn cohort_key_is_sticky_across_calls() {
        let mut cfg = plan_cfg(50, 50);
        cfg.cohort = Some("user-id".into());
        let plan = TrafficPlan::new(&cfg, 0);
        let first = plan.choose(Some("user-42"), 0);
        for _ in 0..10 {
            assert_eq!(plan.choose(Some("user-42"), 0), first);
        }
    }

    #[test]
    fn autodrain_trips_after_high_canary_error_rate() {
        let mut cfg = plan_cfg(50, 50);
        cfg.autodrain = Some(AutoDrainConfig {
            min_requests: 10,
            multiplier: 2.0,
            window_ms: 1_000,
            cooloff_ms: 5_000,
        });
        let plan = TrafficPlan::new(&cfg, 0);
        for _ in 0..8 {
            plan.record_outcome(Variant::Stable, false);
        }
        for i in 0..8 {
            plan.record_outcome(Variant::Canary, i < 6);
        }
        plan.tick(2_000);
        assert_eq!(plan.choose(None, 2_000), Variant::Stable);
    }

    #[tokio::test]
    async fn overload_limiter_rejects_past_queue_capacity() {
        let cfg = OverloadLimiterConfig {
            max_inflight: 1,
            max_queue: 0,
            queue_timeout_ms: 10,
        };
        let limiter = OverloadLimiter::new(&cfg);
        let first = limiter.acquire().await;
        assert!(first.is_some());
        let second = limiter.acquire().await;
        assert!(second.is_none());
    }
}
