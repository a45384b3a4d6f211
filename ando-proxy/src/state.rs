use ando_cache::CacheStore;
use ando_cache::Coalescer;
use ando_core::store::SnapshotStore;
use ando_observability::metrics::MetricsCollector;
use ando_plugin::{FilterBreakerRegistry, PluginPipeline, PluginTransport};
use ando_resilience::Registries;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Everything a request handler needs, shared across every connection for
/// the life of the process. `store` and `registries` are the two halves of
/// the live-reconfiguration split: `store` swaps atomically on every config
/// apply, `registries` outlives every snapshot and is only ever reconciled
/// in place.
pub struct ProxyState {
    pub store: SnapshotStore,
    pub registries: Registries,
    pub cache: CacheStore,
    pub coalescer: Coalescer,
    pub plugins: PluginPipeline,
    /// Same `Arc` the pipeline calls through; kept here too so the handler
    /// can reconcile a route's filter breakers before invoking a phase.
    pub plugin_breakers: Arc<FilterBreakerRegistry>,
    pub metrics: MetricsCollector,
    /// Requests currently executing, for the graceful-shutdown drain wait.
    pub inflight: AtomicU64,
}

impl ProxyState {
    pub fn new(store: SnapshotStore, registries: Registries, transport: Arc<dyn PluginTransport>) -> anyhow::Result<Self> {
        let plugin_breakers = Arc::new(FilterBreakerRegistry::new());
        Ok(Self {
            store,
            registries,
            cache: CacheStore::new(),
            coalescer: Coalescer::new(),
            plugins: PluginPipeline::new(transport, plugin_breakers.clone()),
            plugin_breakers,
            metrics: MetricsCollector::new()?,
            inflight: AtomicU64::new(0),
        })
    }
}
