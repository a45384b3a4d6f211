use crate::route::CompiledRoute;

/// Host + path-prefix + method matcher over a compiled, declaration-ordered
/// route list. Deliberately a linear scan, not a radix trie: ties break on
/// declaration order, and the list is small enough per snapshot that a scan
/// is both correct and fast. Built once per snapshot; immutable afterwards.
pub struct Router {
    routes: Vec<CompiledRoute>,
}

/// Result of a route match: which route, by index into the snapshot's route
/// list (cheaper than cloning the route for the hot path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMatch {
    pub index: usize,
}

impl Router {
    pub fn new(routes: Vec<CompiledRoute>) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &[CompiledRoute] {
        &self.routes
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// `strip :port from host, scan in order, first whose host matches
    /// (case-insensitive) and whose path_prefix is a prefix of the request
    /// path and whose method set (if any) contains the uppercase method.`
    #[inline]
    pub fn match_route(&self, method: &str, path: &str, host: &str) -> Option<RouteMatch> {
        let host = host.split(':').next().unwrap_or(host);
        let method_upper = method.to_ascii_uppercase();

        for (index, route) in self.routes.iter().enumerate() {
            if !route.host.eq_ignore_ascii_case(host) {
                continue;
            }
            if !path.starts_with(route.path_prefix.as_str()) {
                continue;
            }
            if !route.method_allowed(&method_upper) {
                continue;
            }
            return Some(RouteMatch { index });
        }
        None
    }

    pub fn route_at(&self, m: RouteMatch) -> &CompiledRoute {
        &self.routes[m.index]
    }
}
