use crate::config::RouteConfig;
use crate::error::AndoError;
use crate::policy::Policy;
use crate::pool::PoolKey;
use std::collections::HashSet;

/// A route as it lives inside a compiled snapshot. Immutable once built.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub id: String,
    pub host: String,
    pub path_prefix: String,
    /// `None` means any method is accepted.
    pub methods: Option<HashSet<String>>,
    pub pool_name: String,
    pub canary_pool_name: Option<String>,
    pub stable_pool_key: PoolKey,
    pub canary_pool_key: Option<PoolKey>,
    pub policy: Policy,
    pub traffic_plan: Option<String>,
}

impl CompiledRoute {
    /// Compile a raw `RouteConfig` against the set of pool names known to
    /// be valid in this build (duplicate-id and unknown-pool checks are the
    /// builder's responsibility, since they require cross-route state).
    pub fn compile(raw: &RouteConfig) -> Result<Self, AndoError> {
        if raw.host.is_empty() {
            return Err(AndoError::InvalidRoute {
                route_id: raw.id.clone(),
                reason: "host must not be empty".into(),
            });
        }
        if !raw.path_prefix.starts_with('/') {
            return Err(AndoError::InvalidRoute {
                route_id: raw.id.clone(),
                reason: "path_prefix must start with '/'".into(),
            });
        }

        let methods = if raw.methods.is_empty() {
            None
        } else {
            Some(raw.methods.iter().map(|m| m.to_ascii_uppercase()).collect())
        };

        let policy = Policy::compile(&raw.id, &raw.policy)?;

        let stable_pool_key = PoolKey::for_route(&raw.id, &raw.pool);
        let canary_pool_key = raw
            .canary_pool
            .as_ref()
            .map(|p| PoolKey::for_route(&raw.id, p));

        Ok(Self {
            id: raw.id.clone(),
            host: raw.host.clone(),
            path_prefix: raw.path_prefix.clone(),
            methods,
            pool_name: raw.pool.clone(),
            canary_pool_name: raw.canary_pool.clone(),
            stable_pool_key,
            canary_pool_key,
            policy,
            traffic_plan: raw.traffic_plan.clone(),
        })
    }

    #[inline]
    pub fn method_allowed(&self, method: &str) -> bool {
        match &self.methods {
            None => true,
            Some(set) => set.contains(method),
        }
    }

    /// Every pool name this route can possibly route traffic to.
    pub fn referenced_pool_names(&self) -> Vec<&str> {
        let mut names = vec![self.pool_name.as_str()];
        if let Some(ref c) = self.canary_pool_name {
            names.push(c.as_str());
        }
        names
    }
}
