use ando_core::config::AndoConfig;
use ando_core::error::AndoError;
use ando_core::store::SnapshotStore;
use ando_proxy::builder::SnapshotBuilder;
use ando_resilience::Registries;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Whether an `apply` call should only check a config for correctness or
/// actually install it. Mirrors the `/validate` vs `/apply` admin routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Validate,
    Apply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Validated,
    Applied { snapshot_id: u64 },
}

/// The config source collaborator named in spec §6: loads a byte blob of
/// parsed configuration (a YAML file plus `ANDO_`-prefixed environment
/// overrides) and exposes the single `apply(mode)` entrypoint that calls
/// the snapshot builder and, on success and in `Apply` mode, the store's
/// `swap`. Never touches the data plane directly — `ando-admin` and
/// `ando-server` are the only callers.
pub struct ConfigSource {
    path: Option<String>,
    next_id: AtomicU64,
}

impl ConfigSource {
    pub fn new(path: Option<String>) -> Self {
        Self {
            path,
            next_id: AtomicU64::new(1),
        }
    }

    /// Loads and merges the config file with environment overrides. Parse
    /// failures are a config-source error, not a snapshot-builder one — no
    /// registry reconciliation has happened yet at this point.
    pub fn load(&self) -> anyhow::Result<AndoConfig> {
        AndoConfig::load(self.path.as_deref())
    }

    /// Parses a raw YAML byte blob directly, bypassing the file/env loader.
    /// Used by the etcd-backed source (feature `etcd`) where the blob comes
    /// from a watched key rather than the local filesystem.
    pub fn parse_bytes(bytes: &[u8]) -> anyhow::Result<AndoConfig> {
        Ok(serde_yaml::from_slice(bytes)?)
    }

    /// Validates or applies `cfg`. Respects the store's pressure predicate:
    /// an `Apply` is rejected while too many retired snapshots are still
    /// awaiting drain, so a flood of applies during a slow rollout can't
    /// make retirement catch-up unbounded. `Validate` never touches the
    /// store and so is never subject to pressure.
    pub fn apply(
        &self,
        mode: ApplyMode,
        cfg: &AndoConfig,
        registries: &Registries,
        store: &SnapshotStore,
        source: &str,
        now_millis: u64,
        now_utc: DateTime<Utc>,
    ) -> Result<ApplyOutcome, AndoError> {
        if mode == ApplyMode::Apply && store.pressure() {
            return Err(AndoError::Pressure {
                retired: store.retired_count(),
                max: store.max_retired(),
            });
        }

        let next_id = self.next_id.load(Ordering::Acquire);
        let snapshot = SnapshotBuilder::build(cfg, registries, source, next_id, now_millis, now_utc)?;

        match mode {
            ApplyMode::Validate => Ok(ApplyOutcome::Validated),
            ApplyMode::Apply => {
                self.next_id.fetch_add(1, Ordering::AcqRel);
                let snapshot_id = snapshot.id;
                store.swap(Arc::new(snapshot), now_millis as i64);
                Ok(ApplyOutcome::Applied { snapshot_id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ando_core::config::LoggingConfig;
    use ando_core::limits::Limits;
    use ando_core::router::Router;
    use ando_core::snapshot::Snapshot;
    use std::collections::HashMap;

    fn empty_store() -> SnapshotStore {
        SnapshotStore::new(Arc::new(Snapshot::new(
            0,
            "v0".into(),
            "test".into(),
            Utc::now(),
            Router::new(vec![]),
            HashMap::new(),
            HashMap::new(),
            None,
            Limits::default(),
            LoggingConfig::default(),
        )))
    }

    fn empty_config() -> AndoConfig {
        ConfigSource::parse_bytes(b"{}").unwrap()
    }

    #[test]
    fn validate_never_consults_pressure() {
        let store = empty_store();
        store.set_max_retired(0);
        let source = ConfigSource::new(None);
        let registries = Registries::new();
        let cfg = empty_config();
        let outcome = source.apply(
            ApplyMode::Validate,
            &cfg,
            &registries,
            &store,
            "test",
            0,
            Utc::now(),
        );
        assert_eq!(outcome.unwrap(), ApplyOutcome::Validated);
    }

    #[test]
    fn apply_rejects_under_pressure() {
        let store = empty_store();
        store.set_max_retired(0);
        let handle = store.acquire();
        store.swap(
            Arc::new(Snapshot::new(
                1,
                "v1".into(),
                "test".into(),
                Utc::now(),
                Router::new(vec![]),
                HashMap::new(),
                HashMap::new(),
                None,
                Limits::default(),
                LoggingConfig::default(),
            )),
            0,
        );
        drop(handle);
        assert!(store.pressure());

        let source = ConfigSource::new(None);
        let registries = Registries::new();
        let cfg = empty_config();
        let outcome = source.apply(ApplyMode::Apply, &cfg, &registries, &store, "test", 0, Utc::now());
        assert!(matches!(outcome, Err(AndoError::Pressure { .. })));
    }

    #[test]
    fn apply_swaps_and_increments_snapshot_id() {
        let store = empty_store();
        let source = ConfigSource::new(None);
        let registries = Registries::new();
        let cfg = empty_config();
        let outcome = source
            .apply(ApplyMode::Apply, &cfg, &registries, &store, "test", 0, Utc::now())
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied { snapshot_id: 1 });
        assert_eq!(store.peek_current().id, 1);
    }
}
