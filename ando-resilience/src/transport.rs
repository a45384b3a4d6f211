use ando_core::config::TransportConfig;
use dashmap::DashMap;
use std::sync::Arc;

/// One pooled `reqwest::Client` plus the options it was built from. Kept
/// distinct from `endpoint::PoolRuntime` because a client is recreated only
/// when transport options change, while endpoints come and go independently.
pub struct TransportEntry {
    pub client: reqwest::Client,
    pub options: TransportConfig,
    pub created_at_millis: u64,
}

fn build_client(options: &TransportConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_millis(options.connect_timeout_ms))
        .pool_idle_timeout(std::time::Duration::from_millis(options.pool_idle_timeout_ms))
        .build()
        .expect("reqwest client builder with static options cannot fail")
}

fn options_equal(a: &TransportConfig, b: &TransportConfig) -> bool {
    a.connect_timeout_ms == b.connect_timeout_ms && a.pool_idle_timeout_ms == b.pool_idle_timeout_ms
}

/// Registry of transports keyed by the bare pool name (`PoolKey::transport`).
/// Old transports are kept alive until `drain_ttl_ms` elapses after
/// replacement, so in-flight connections drain instead of being cut.
#[derive(Default)]
pub struct TransportRegistry {
    current: DashMap<String, Arc<TransportEntry>>,
    draining: DashMap<String, Vec<(Arc<TransportEntry>, u64)>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the transport for `pool_name`. A no-op when the
    /// options are unchanged, so unrelated reconciles never churn sockets.
    pub fn reconcile(&self, pool_name: &str, options: TransportConfig, now_millis: u64) {
        if let Some(existing) = self.current.get(pool_name) {
            if options_equal(&existing.options, &options) {
                return;
            }
        }
        let entry = Arc::new(TransportEntry {
            client: build_client(&options),
            options,
            created_at_millis: now_millis,
        });
        if let Some((_, old)) = self.current.remove(pool_name) {
            self.draining
                .entry(pool_name.to_string())
                .or_default()
                .push((old, now_millis));
        }
        self.current.insert(pool_name.to_string(), entry);
    }

    pub fn get(&self, pool_name: &str) -> Option<Arc<TransportEntry>> {
        self.current.get(pool_name).map(|e| e.clone())
    }

    /// Drop draining transports past their TTL. Live `reqwest::Client`
    /// clones held by in-flight requests keep working via `Arc` refcounting
    /// even after this removes the registry's own reference.
    pub fn reap(&self, drain_ttl_ms: u64, now_millis: u64) {
        for mut entry in self.draining.iter_mut() {
            entry
                .value_mut()
                .retain(|(_, retired_at)| now_millis.saturating_sub(*retired_at) < drain_ttl_ms);
        }
    }

    pub fn prune(&self, desired_pool_names: &std::collections::HashSet<String>) {
        self.current.retain(|k, _| desired_pool_names.contains(k));
        self.draining.retain(|k, _| desired_pool_names.contains(k));
    }

    pub fn draining_count(&self, pool_name: &str) -> usize {
        self.draining.get(pool_name).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(connect_ms: u64) -> TransportConfig {
        TransportConfig {
            connect_timeout_ms: connect_ms,
            pool_idle_timeout_ms: 30_000,
            drain_ttl_ms: 5_000,
        }
    }

    #[test]
    fn reconcile_with_unchanged_options_does_not_recreate() {
        let reg = TransportRegistry::new();
        reg.reconcile("p1", opts(100), 0);
        let first = reg.get("p1").unwrap();
        reg.reconcile("p1", opts(100), 10);
        let second = reg.get("p1").unwrap();
        assert_eq!(first.created_at_millis, second.created_at_millis);
    }

    #[test]
    fn reconcile_with_changed_options_retires_old_client() {
        let reg = TransportRegistry::new();
        reg.reconcile("p1", opts(100), 0);
        reg.reconcile("p1", opts(200), 10);
        assert_eq!(reg.draining_count("p1"), 1);
        assert_eq!(reg.get("p1").unwrap().options.connect_timeout_ms, 200);
    }

    #[test]
    fn reap_drops_expired_draining_entries() {
        let reg = TransportRegistry::new();
        reg.reconcile("p1", opts(100), 0);
        reg.reconcile("p1", opts(200), 10);
        reg.reap(5_000, 20_000);
        assert_eq!(reg.draining_count("p1"), 0);
    }

    #[test]
    fn prune_removes_unreferenced_pools() {
        let reg = TransportRegistry::new();
        reg.reconcile("p1", opts(100), 0);
        let desired = std::collections::HashSet::new();
        reg.prune(&desired);
        assert!(reg.get("p1").is_none());
    }
}
