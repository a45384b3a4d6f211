use std::fmt;

/// A stable identifier for resilience-registry state: `route_id::pool_name`
/// for per-route state (breaker, outlier), or the bare pool name for
/// transport pooling, which is shared across routes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey(String);

impl PoolKey {
    pub fn for_route(route_id: &str, pool_name: &str) -> Self {
        Self(format!("{route_id}::{pool_name}"))
    }

    pub fn transport(pool_name: &str) -> Self {
        Self(pool_name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<PoolKey> for String {
    fn from(k: PoolKey) -> Self {
        k.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_scoped_key_format() {
        let k = PoolKey::for_route("r1", "backend-a");
        assert_eq!(k.as_str(), "r1::backend-a");
    }

    #[test]
    fn transport_key_is_bare_pool_name() {
        let k = PoolKey::transport("backend-a");
        assert_eq!(k.as_str(), "backend-a");
    }
}
