use ando_core::policy::RetryBudgetPolicy;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

/// A fractional token bucket: every successful (non-retry) attempt deposits
/// `percent / 100` tokens, capped at `burst`. A retry consumes one token;
/// no tokens means the retry is denied and the budget's caller must treat
/// the response as final.
struct Bucket {
    tokens: Mutex<f64>,
    percent: f64,
    burst: f64,
}

impl Bucket {
    fn new(policy: &RetryBudgetPolicy) -> Self {
        Self {
            tokens: Mutex::new(policy.burst as f64),
            percent: policy.percent as f64,
            burst: policy.burst as f64,
        }
    }

    fn record_success(&self) {
        let mut tokens = self.tokens.lock().unwrap();
        *tokens = (*tokens + self.percent / 100.0).min(self.burst);
    }

    fn consume(&self) -> bool {
        let mut tokens = self.tokens.lock().unwrap();
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

const ANONYMOUS_BUCKET: &str = "anonymous";

/// Per-route retry budget, plus an optional LRU of per-client sub-budgets
/// when the route's policy enables a client retry cap.
pub struct RouteBudget {
    global: Bucket,
    client_cap_enabled: bool,
    lru_size: usize,
    clients: Mutex<VecDeque<(String, Bucket)>>,
    policy: RetryBudgetPolicy,
}

impl RouteBudget {
    fn new(policy: RetryBudgetPolicy, client_cap_enabled: bool, lru_size: usize) -> Self {
        Self {
            global: Bucket::new(&policy),
            client_cap_enabled,
            lru_size: lru_size.max(1),
            clients: Mutex::new(VecDeque::new()),
            policy,
        }
    }

    pub fn record_success(&self, client_key: Option<&str>) {
        self.global.record_success();
        if let Some(key) = client_key.filter(|_| self.client_cap_enabled) {
            self.client_bucket(key).record_success();
        }
    }

    /// Consume one token from the global budget, and from the client's
    /// sub-budget if client capping is enabled. Both must have tokens for
    /// the retry to proceed.
    pub fn consume(&self, client_key: Option<&str>) -> bool {
        if !self.global.consume() {
            return false;
        }
        if let Some(key) = client_key.filter(|_| self.client_cap_enabled) {
            if !self.client_bucket(key).consume() {
                return false;
            }
        }
        true
    }

    fn client_bucket(&self, key: &str) -> ClientBucketHandle<'_> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(pos) = clients.iter().position(|(k, _)| k == key) {
            let (k, bucket) = clients.remove(pos).unwrap();
            clients.push_back((k, bucket));
        } else {
            if clients.len() >= self.lru_size {
                clients.pop_front();
            }
            clients.push_back((key.to_string(), Bucket::new(&self.policy)));
        }
        drop(clients);
        ClientBucketHandle { owner: self, key: key.to_string() }
    }
}

/// Thin indirection so `client_bucket` can operate on the LRU while the
/// caller still sees a simple `record_success`/`consume` surface.
struct ClientBucketHandle<'a> {
    owner: &'a RouteBudget,
    key: String,
}

impl ClientBucketHandle<'_> {
    fn record_success(&self) {
        let clients = self.owner.clients.lock().unwrap();
        if let Some((_, bucket)) = clients.iter().find(|(k, _)| *k == self.key) {
            bucket.record_success();
        }
    }

    fn consume(&self) -> bool {
        let clients = self.owner.clients.lock().unwrap();
        clients
            .iter()
            .find(|(k, _)| *k == self.key)
            .map(|(_, bucket)| bucket.consume())
            .unwrap_or(true)
    }
}

/// Registry of per-route retry budgets, keyed by route id.
#[derive(Default)]
pub struct RetryBudgetRegistry {
    budgets: DashMap<String, std::sync::Arc<RouteBudget>>,
}

impl RetryBudgetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconcile(
        &self,
        route_id: &str,
        policy: RetryBudgetPolicy,
        client_cap_enabled: bool,
        lru_size: usize,
    ) {
        self.budgets.insert(
            route_id.to_string(),
            std::sync::Arc::new(RouteBudget::new(policy, client_cap_enabled, lru_size)),
        );
    }

    pub fn prune(&self, desired_route_ids: &std::collections::HashSet<String>) {
        self.budgets.retain(|k, _| desired_route_ids.contains(k));
    }

    pub fn get(&self, route_id: &str) -> Option<std::sync::Arc<RouteBudget>> {
        self.budgets.get(route_id).map(|b| b.clone())
    }

    /// Resolves the client key used for per-client capping: `ip` or a named
    /// request header, falling back to the anonymous bucket when absent.
    pub fn client_key<'a>(
        key: &ando_core::policy::ClientCapKey,
        remote_ip: &'a str,
        header_lookup: impl Fn(&str) -> Option<&'a str>,
    ) -> std::borrow::Cow<'a, str> {
        match key {
            ando_core::policy::ClientCapKey::Ip => std::borrow::Cow::Borrowed(remote_ip),
            ando_core::policy::ClientCapKey::Header(name) => header_lookup(name)
                .map(std::borrow::Cow::Borrowed)
                .unwrap_or(std::borrow::Cow::Borrowed(ANONYMOUS_BUCKET)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryBudgetPolicy {
        RetryBudgetPolicy { percent: 10, burst: 5 }
    }

    #[test]
    fn fresh_budget_starts_full_at_burst() {
        let budget = RouteBudget::new(policy(), false, 4);
        for _ in 0..5 {
            assert!(budget.consume(None));
        }
        assert!(!budget.consume(None));
    }

    #[test]
    fn record_success_accumulates_fractional_tokens_capped_at_burst() {
        let budget = RouteBudget::new(policy(), false, 4);
        for _ in 0..5 {
            assert!(budget.consume(None));
        }
        assert!(!budget.consume(None));
        for _ in 0..10 {
            budget.record_success();
        }
        assert!(budget.consume(None));
        assert!(!budget.consume(None));
    }

    #[test]
    fn client_cap_is_independent_of_global_when_enabled() {
        let budget = RouteBudget::new(RetryBudgetPolicy { percent: 10, burst: 100 }, true, 4);
        for _ in 0..5 {
            assert!(budget.consume(Some("client-a")));
        }
        assert!(!budget.consume(Some("client-a")));
        assert!(budget.consume(Some("client-b")));
    }

    #[test]
    fn lru_evicts_oldest_client_bucket() {
        let budget = RouteBudget::new(RetryBudgetPolicy { percent: 10, burst: 5 }, true, 2);
        budget.consume(Some("a"));
        budget.consume(Some("b"));
        budget.consume(Some("c"));
        // "a" should have been evicted; consuming it starts a fresh bucket.
        assert!(budget.consume(Some("a")));
    }

    #[test]
    fn client_key_falls_back_to_anonymous_when_header_missing() {
        let key = RetryBudgetRegistry::client_key(
            &ando_core::policy::ClientCapKey::Header("X-Client".into()),
            "127.0.0.1",
            |_| None,
        );
        assert_eq!(key, "anonymous");
    }
}
