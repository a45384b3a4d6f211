use ando_core::config::AndoConfig;
use ando_core::error::AndoError;
use ando_core::limits::Limits;
use ando_core::pool::PoolKey;
use ando_core::route::CompiledRoute;
use ando_core::router::Router;
use ando_core::snapshot::{PoolRuntimeConfig, Snapshot};
use ando_core::tls::TlsMaterial;
use ando_resilience::Registries;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// Validates a parsed `AndoConfig` against the shared resilience registries
/// and compiles an immutable `Snapshot`, or rejects the config and leaves
/// every registry exactly as it was before the call started as far as the
/// currently-serving snapshot is concerned. Registries reconciled during a
/// failed build are not rolled back — they only gain new pool/breaker
/// entries, never remove ones still referenced by the live snapshot — so a
/// half-finished reconcile pass does not take the running proxy down.
pub struct SnapshotBuilder;

impl SnapshotBuilder {
    /// `next_id` is caller-supplied (monotonically increasing); `now_millis`
    /// and `now_utc` are injected so tests can use a deterministic clock.
    pub fn build(
        cfg: &AndoConfig,
        registries: &Registries,
        source: &str,
        next_id: u64,
        now_millis: u64,
        now_utc: DateTime<Utc>,
    ) -> Result<Snapshot, AndoError> {
        let limits = Limits::build(&cfg.limits)?;

        let mut pools: HashMap<String, PoolKey> = HashMap::new();
        let mut pool_configs: HashMap<String, PoolRuntimeConfig> = HashMap::new();
        let mut desired_pool_names: HashSet<String> = HashSet::new();

        for (pool_name, pool_cfg) in &cfg.pools {
            if pool_cfg.endpoints.is_empty() {
                return Err(AndoError::InvalidPool {
                    pool: pool_name.clone(),
                    reason: "pool has no endpoints".into(),
                });
            }

            registries.pools.reconcile(
                pool_name,
                &pool_cfg.endpoints,
                pool_cfg.passive_health.clone(),
                now_millis,
            );
            registries
                .transports
                .reconcile(pool_name, pool_cfg.transport.clone(), now_millis);

            let desired_addrs: HashSet<String> = pool_cfg.endpoints.iter().cloned().collect();
            for addr in &pool_cfg.endpoints {
                registries
                    .outliers
                    .reconcile(pool_name, addr, pool_cfg.outlier.clone());
            }
            registries.outliers.prune(pool_name, &desired_addrs);

            pools.insert(pool_name.clone(), PoolKey::transport(pool_name));
            pool_configs.insert(
                pool_name.clone(),
                PoolRuntimeConfig {
                    breaker_cfg: pool_cfg.breaker.clone(),
                    outlier_cfg: pool_cfg.outlier.clone(),
                },
            );
            desired_pool_names.insert(pool_name.clone());
        }

        registries.pools.prune(&desired_pool_names);
        registries.transports.prune(&desired_pool_names);
        registries.outliers.prune_pools(&desired_pool_names);

        let mut compiled_routes = Vec::with_capacity(cfg.routes.len());
        let mut seen_route_ids: HashSet<String> = HashSet::new();
        let mut desired_breaker_keys: HashSet<String> = HashSet::new();
        let mut desired_route_ids: HashSet<String> = HashSet::new();
        let mut desired_plan_names: HashSet<String> = HashSet::new();

        for raw_route in &cfg.routes {
            if !seen_route_ids.insert(raw_route.id.clone()) {
                return Err(AndoError::DuplicateRouteId(raw_route.id.clone()));
            }
            if !desired_pool_names.contains(&raw_route.pool) {
                return Err(AndoError::UnknownPool(raw_route.pool.clone()));
            }
            if let Some(canary) = &raw_route.canary_pool {
                if !desired_pool_names.contains(canary) {
                    return Err(AndoError::UnknownPool(canary.clone()));
                }
            }

            let route = CompiledRoute::compile(raw_route)?;

            let stable_cfg = pool_configs.get(&route.pool_name).expect("pool validated above");
            registries
                .breakers
                .reconcile(route.stable_pool_key.as_str(), stable_cfg.breaker_cfg.clone());
            desired_breaker_keys.insert(route.stable_pool_key.as_str().to_string());

            if let (Some(canary_key), Some(canary_name)) =
                (&route.canary_pool_key, &route.canary_pool_name)
            {
                let canary_cfg = pool_configs.get(canary_name).expect("pool validated above");
                registries
                    .breakers
                    .reconcile(canary_key.as_str(), canary_cfg.breaker_cfg.clone());
                desired_breaker_keys.insert(canary_key.as_str().to_string());
            }

            registries.retry_budgets.reconcile(
                &route.id,
                route.policy.retry_budget.clone(),
                route.policy.client_retry_cap.enabled,
                route.policy.client_retry_cap.lru_size,
            );
            desired_route_ids.insert(route.id.clone());

            if let Some(plan_name) = &route.traffic_plan {
                let plan_cfg = cfg.traffic_plans.get(plan_name).ok_or_else(|| {
                    AndoError::InvalidRoute {
                        route_id: route.id.clone(),
                        reason: format!("unknown traffic_plan {plan_name:?}"),
                    }
                })?;
                if desired_plan_names.insert(plan_name.clone()) {
                    registries.traffic.reconcile(plan_name, plan_cfg, now_millis);
                }
            }

            compiled_routes.push(route);
        }

        registries.breakers.prune(&desired_breaker_keys);
        registries.retry_budgets.prune(&desired_route_ids);
        registries.traffic.prune(&desired_plan_names);

        let requires_mtls = compiled_routes.iter().any(|r| r.policy.require_mtls);
        let tls = cfg.tls.as_ref().map(|t| TlsMaterial {
            cert_file: t.cert_file.display().to_string(),
            key_file: t.key_file.display().to_string(),
            client_ca_file: t.client_ca_file.as_ref().map(|p| p.display().to_string()),
        });
        if requires_mtls {
            match &tls {
                Some(material) if material.has_client_ca() => {}
                _ => return Err(AndoError::MtlsMisconfigured),
            }
        }

        let router = Router::new(compiled_routes);

        Ok(Snapshot::new(
            next_id,
            format!("{source}-{next_id}"),
            source.to_string(),
            now_utc,
            router,
            pools,
            pool_configs,
            tls,
            limits,
            cfg.logging.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ando_core::config::{PoolConfig, RouteConfig, RoutePolicyConfig};
    use std::collections::HashMap;

    fn base_cfg() -> AndoConfig {
        AndoConfig {
            node_id: "node1".into(),
            proxy: Default::default(),
            admin: Default::default(),
            observability: Default::default(),
            limits: Default::default(),
            logging: Default::default(),
            tls: None,
            pools: HashMap::new(),
            routes: vec![],
            traffic_plans: HashMap::new(),
            config_source: Default::default(),
        }
    }

    fn pool(endpoints: &[&str]) -> PoolConfig {
        PoolConfig {
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
            breaker: Default::default(),
            outlier: Default::default(),
            transport: Default::default(),
            passive_health: Default::default(),
        }
    }

    fn route(id: &str, pool: &str) -> RouteConfig {
        RouteConfig {
            id: id.into(),
            host: "example.com".into(),
            path_prefix: "/".into(),
            methods: vec![],
            pool: pool.into(),
            canary_pool: None,
            traffic_plan: None,
            policy: RoutePolicyConfig::default(),
        }
    }

    #[test]
    fn builds_snapshot_with_one_pool_and_route() {
        let mut cfg = base_cfg();
        cfg.pools.insert("p1".into(), pool(&["127.0.0.1:8080"]));
        cfg.routes.push(route("r1", "p1"));
        let registries = Registries::new();

        let snap = SnapshotBuilder::build(&cfg, &registries, "file", 1, 0, Utc::now()).unwrap();
        assert_eq!(snap.router.route_count(), 1);
        assert!(registries.pools.get("p1").is_some());
        assert!(registries.breakers.admit("r1::p1", 0));
    }

    #[test]
    fn rejects_route_referencing_unknown_pool() {
        let mut cfg = base_cfg();
        cfg.routes.push(route("r1", "missing"));
        let registries = Registries::new();
        assert!(SnapshotBuilder::build(&cfg, &registries, "file", 1, 0, Utc::now()).is_err());
    }

    #[test]
    fn rejects_duplicate_route_ids() {
        let mut cfg = base_cfg();
        cfg.pools.insert("p1".into(), pool(&["127.0.0.1:8080"]));
        cfg.routes.push(route("r1", "p1"));
        cfg.routes.push(route("r1", "p1"));
        let registries = Registries::new();
        assert!(SnapshotBuilder::build(&cfg, &registries, "file", 1, 0, Utc::now()).is_err());
    }

    #[test]
    fn rejects_empty_pool_endpoints() {
        let mut cfg = base_cfg();
        cfg.pools.insert("p1".into(), pool(&[]));
        let registries = Registries::new();
        assert!(SnapshotBuilder::build(&cfg, &registries, "file", 1, 0, Utc::now()).is_err());
    }

    #[test]
    fn require_mtls_without_client_ca_is_rejected() {
        let mut cfg = base_cfg();
        cfg.pools.insert("p1".into(), pool(&["127.0.0.1:8080"]));
        let mut r = route("r1", "p1");
        r.policy.require_mtls = true;
        cfg.routes.push(r);
        let registries = Registries::new();
        assert!(SnapshotBuilder::build(&cfg, &registries, "file", 1, 0, Utc::now()).is_err());
    }

    #[test]
    fn prune_removes_pool_dropped_from_config() {
        let mut cfg = base_cfg();
        cfg.pools.insert("p1".into(), pool(&["127.0.0.1:8080"]));
        cfg.routes.push(route("r1", "p1"));
        let registries = Registries::new();
        SnapshotBuilder::build(&cfg, &registries, "file", 1, 0, Utc::now()).unwrap();
        assert!(registries.pools.get("p1").is_some());

        let cfg2 = base_cfg();
        SnapshotBuilder::build(&cfg2, &registries, "file", 2, 0, Utc::now()).unwrap();
        assert!(registries.pools.get("p1").is_none());
    }
}
