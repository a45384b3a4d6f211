use crate::config::{BreakerConfig, LoggingConfig, OutlierConfig};
use crate::limits::Limits;
use crate::pool::PoolKey;
use crate::router::Router;
use crate::tls::TlsMaterial;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// Per-pool resilience defaults carried in the snapshot; the breaker and
/// outlier registries key their actual mutable state off `route_id::pool`,
/// but look these config values up here to know how to behave.
#[derive(Debug, Clone)]
pub struct PoolRuntimeConfig {
    pub breaker_cfg: BreakerConfig,
    pub outlier_cfg: OutlierConfig,
}

/// An immutable compiled configuration. Every in-flight request executes
/// against exactly one of these for its whole lifetime.
pub struct Snapshot {
    pub id: u64,
    pub version: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub router: Router,
    /// Pool name -> transport-level pool key (bare pool name today, but
    /// kept distinct from `String` so callers can't confuse it with a
    /// route-scoped key).
    pub pools: HashMap<String, PoolKey>,
    pub pool_configs: HashMap<String, PoolRuntimeConfig>,
    pub tls: Option<TlsMaterial>,
    pub limits: Limits,
    pub logging: LoggingConfig,

    refcount: AtomicUsize,
    /// 0 while current; set to the retirement timestamp (millis since
    /// epoch) once replaced by a newer snapshot.
    retired_at: AtomicI64,
}

impl Snapshot {
    pub fn new(
        id: u64,
        version: String,
        source: String,
        created_at: DateTime<Utc>,
        router: Router,
        pools: HashMap<String, PoolKey>,
        pool_configs: HashMap<String, PoolRuntimeConfig>,
        tls: Option<TlsMaterial>,
        limits: Limits,
        logging: LoggingConfig,
    ) -> Self {
        Self {
            id,
            version,
            source,
            created_at,
            router,
            pools,
            pool_configs,
            tls,
            limits,
            logging,
            refcount: AtomicUsize::new(0),
            retired_at: AtomicI64::new(0),
        }
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.load(Ordering::Acquire) != 0
    }

    pub(crate) fn incref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the refcount after decrementing.
    pub(crate) fn decref(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn mark_retired(&self, at_millis: i64) {
        self.retired_at.store(at_millis, Ordering::Release);
    }

    pub fn requires_mtls_somewhere(&self) -> bool {
        self.router.routes().iter().any(|r| r.policy.require_mtls)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("source", &self.source)
            .field("routes", &self.router.route_count())
            .field("refcount", &self.refcount())
            .field("retired", &self.is_retired())
            .finish()
    }
}
