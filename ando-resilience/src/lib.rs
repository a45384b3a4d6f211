pub mod breaker;
pub mod clock;
pub mod endpoint;
pub mod outlier;
pub mod retry_budget;
pub mod traffic;
pub mod transport;

pub use breaker::{Breaker, BreakerRegistry, BreakerState};
pub use clock::{Clock, MonotonicClock};
pub use endpoint::{PickResult, PoolRegistry, PoolRuntime};
pub use outlier::OutlierRegistry;
pub use retry_budget::{RetryBudgetRegistry, RouteBudget};
pub use traffic::{OverloadLimiter, TrafficPlan, TrafficRegistry, Variant};
pub use transport::{TransportEntry, TransportRegistry};

/// The full set of shared resilience registries the snapshot builder
/// reconciles and the request path reads from. One instance is shared
/// across all snapshots for the life of the server process: registries
/// outlive any single snapshot, which is why they are never part of the
/// immutable `Snapshot` in `ando-core`.
#[derive(Default)]
pub struct Registries {
    pub pools: PoolRegistry,
    pub transports: TransportRegistry,
    pub breakers: BreakerRegistry,
    pub outliers: OutlierRegistry,
    pub retry_budgets: RetryBudgetRegistry,
    pub traffic: TrafficRegistry,
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Background maintenance: drain reaping, outlier/breaker window aging
    /// is lazy (computed on read), so only the TTL-based reaps need a
    /// periodic tick. Intended to be called from a `tokio::time::interval`
    /// loop owned by `ando-server`.
    pub fn tick(&self, drain_timeout_ms: u64, transport_drain_ttl_ms: u64, now_millis: u64) {
        self.pools.reap_all(drain_timeout_ms, now_millis);
        self.transports.reap(transport_drain_ttl_ms, now_millis);
        self.traffic.tick_all(now_millis);
    }
}
