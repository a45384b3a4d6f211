use crate::engine::{AttemptContext, Engine};
use ando_core::error::ErrorCategory;
use ando_core::policy::{ClientCapKey, RetryPolicy};
use ando_resilience::{RetryBudgetRegistry, Registries};
use bytes::Bytes;
use http::{HeaderMap, Method};
use rand::Rng;
use std::time::Instant;

const REPLAYABLE_METHODS: [&str; 6] = ["GET", "HEAD", "PUT", "DELETE", "OPTIONS", "TRACE"];

pub struct RetryOutcome {
    pub response: Option<reqwest::Response>,
    pub upstream_addr: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub attempts: u32,
    pub last_retry_reason: Option<String>,
    pub retry_budget_exhausted: bool,
    /// Drawn from the last attempt's endpoint pick, for access-log fields.
    pub outlier_ignored: bool,
    pub endpoint_ejected: bool,
    pub selected_fail_open: bool,
}

/// Per-attempt template, rebuilt with a fresh timeout for every try.
pub struct RetryRequest {
    pub pool_name: String,
    pub breaker_key: String,
    pub route_id: String,
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: String,
    pub inbound_tls: bool,
    pub max_eject_percent: u32,
    pub client_cap_key: Option<String>,
}

pub struct RetryExecutor<'a> {
    engine: Engine<'a>,
    registries: &'a Registries,
}

impl<'a> RetryExecutor<'a> {
    pub fn new(registries: &'a Registries) -> Self {
        Self {
            engine: Engine::new(registries),
            registries,
        }
    }

    /// `deadline` is the overall per-request deadline (handler's
    /// `request_timeout_ms` clock); `now_millis` supplies wall-clock millis
    /// for registry bookkeeping.
    pub async fn execute(
        &self,
        policy: &RetryPolicy,
        req: &RetryRequest,
        deadline: Instant,
        now_millis: impl Fn() -> u64,
    ) -> RetryOutcome {
        let retryable = policy.enabled
            && policy.max_attempts > 1
            && REPLAYABLE_METHODS.contains(&req.method.as_str())
            && req.body.is_empty();

        let mut attempt_num: u32 = 1;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now()).as_millis() as u64;
            if remaining == 0 {
                return RetryOutcome {
                    response: None,
                    upstream_addr: None,
                    error_category: Some(ErrorCategory::RequestTimeout),
                    attempts: attempt_num,
                    last_retry_reason: None,
                    retry_budget_exhausted: false,
                    outlier_ignored: false,
                    endpoint_ejected: false,
                    selected_fail_open: false,
                };
            }
            let timeout_ms = if policy.per_try_timeout_ms == 0 {
                remaining
            } else {
                remaining.min(policy.per_try_timeout_ms)
            };

            let ctx = AttemptContext {
                pool_name: req.pool_name.clone(),
                breaker_key: req.breaker_key.clone(),
                method: req.method.clone(),
                path_and_query: req.path_and_query.clone(),
                headers: req.headers.clone(),
                body: req.body.clone(),
                remote_addr: req.remote_addr.clone(),
                inbound_tls: req.inbound_tls,
                max_eject_percent: req.max_eject_percent,
                timeout_ms,
            };

            let now = now_millis();
            let outcome = self.engine.attempt(&ctx, now).await;
            let (outlier_ignored, endpoint_ejected, selected_fail_open) = match &outcome.pick {
                Some(pick) => (pick.outlier_ignored, pick.endpoint_ejected, pick.selected_fail_open),
                None => (false, false, false),
            };

            if let Some(response) = outcome.response {
                let status = response.status().as_u16();
                let should_retry = retryable
                    && policy.retry_on_status.contains(&status)
                    && attempt_num < policy.max_attempts;

                if !should_retry {
                    if !policy.retry_on_status.contains(&status) {
                        self.record_success(&req.route_id, req.client_cap_key.as_deref());
                    }
                    return RetryOutcome {
                        response: Some(response),
                        upstream_addr: outcome.upstream_addr,
                        error_category: None,
                        attempts: attempt_num,
                        last_retry_reason: None,
                        retry_budget_exhausted: false,
                        outlier_ignored,
                        endpoint_ejected,
                        selected_fail_open,
                    };
                }

                let reason = format!("status_{status}");
                if !self.consume_budget(&req.route_id, req.client_cap_key.as_deref()) {
                    return RetryOutcome {
                        response: Some(response),
                        upstream_addr: outcome.upstream_addr,
                        error_category: None,
                        attempts: attempt_num,
                        last_retry_reason: Some(reason),
                        retry_budget_exhausted: true,
                        outlier_ignored,
                        endpoint_ejected,
                        selected_fail_open,
                    };
                }

                drop(response);
                self.sleep_backoff(policy).await;
                attempt_num += 1;
                continue;
            }

            let category = outcome.error_category.unwrap_or(ErrorCategory::BadGateway);
            let reason = classify_error_reason(category);
            let should_retry =
                retryable && policy.retry_on_errors.iter().any(|r| r == reason) && attempt_num < policy.max_attempts;

            if !should_retry {
                return RetryOutcome {
                    response: None,
                    upstream_addr: outcome.upstream_addr,
                    error_category: Some(category),
                    attempts: attempt_num,
                    last_retry_reason: None,
                    retry_budget_exhausted: false,
                    outlier_ignored,
                    endpoint_ejected,
                    selected_fail_open,
                };
            }

            if !self.consume_budget(&req.route_id, req.client_cap_key.as_deref()) {
                return RetryOutcome {
                    response: None,
                    upstream_addr: outcome.upstream_addr,
                    error_category: Some(category),
                    attempts: attempt_num,
                    last_retry_reason: Some(reason.to_string()),
                    retry_budget_exhausted: true,
                    outlier_ignored,
                    endpoint_ejected,
                    selected_fail_open,
                };
            }

            self.sleep_backoff(policy).await;
            attempt_num += 1;
        }
    }

    fn consume_budget(&self, route_id: &str, client_key: Option<&str>) -> bool {
        match self.registries.retry_budgets.get(route_id) {
            Some(budget) => budget.consume(client_key),
            None => true,
        }
    }

    fn record_success(&self, route_id: &str, client_key: Option<&str>) {
        if let Some(budget) = self.registries.retry_budgets.get(route_id) {
            budget.record_success(client_key);
        }
    }

    async fn sleep_backoff(&self, policy: &RetryPolicy) {
        let jitter = if policy.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=policy.jitter_ms)
        };
        let delay = policy.backoff_ms + jitter;
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
    }
}

fn classify_error_reason(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::UpstreamConnectFailed => "dial",
        ErrorCategory::UpstreamTimeout => "timeout",
        _ => "reset",
    }
}

/// Resolves the client identity used for per-client retry capping, per the
/// route's configured `client_retry_cap.key`.
pub fn resolve_client_cap_key<'a>(
    key: &ClientCapKey,
    remote_ip: &'a str,
    headers: &'a HeaderMap,
) -> String {
    RetryBudgetRegistry::client_key(key, remote_ip, |name| {
        headers.get(name).and_then(|v| v.to_str().ok())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_connect_and_timeout() {
        assert_eq!(classify_error_reason(ErrorCategory::UpstreamConnectFailed), "dial");
        assert_eq!(classify_error_reason(ErrorCategory::UpstreamTimeout), "timeout");
        assert_eq!(classify_error_reason(ErrorCategory::BadGateway), "reset");
    }

    #[test]
    fn client_cap_key_falls_back_to_ip() {
        let headers = HeaderMap::new();
        let key = resolve_client_cap_key(&ClientCapKey::Ip, "203.0.113.5", &headers);
        assert_eq!(key, "203.0.113.5");
    }
}
