use crate::breaker::FilterBreakerRegistry;
use crate::context::apply_mutations;
use crate::transport::{FilterRequestBody, FilterResponseBody, PluginTransport, TransportError};
use ando_core::error::ErrorCategory;
use ando_core::policy::{FailureMode, PluginFilter};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub enum PhaseOutcome {
    Continue {
        headers: HashMap<String, String>,
        mutation_denied: bool,
    },
    Respond {
        status: u16,
        headers: HashMap<String, String>,
        body: Option<Vec<u8>>,
    },
    Error(ErrorCategory),
}

pub struct RequestPhaseInput<'a> {
    pub route_id: &'a str,
    pub method: &'a str,
    pub uri: &'a str,
    pub host: &'a str,
    pub headers: HashMap<String, String>,
}

pub struct ResponsePhaseInput<'a> {
    pub route_id: &'a str,
    pub method: &'a str,
    pub uri: &'a str,
    pub host: &'a str,
    pub response_status: u16,
    pub headers: HashMap<String, String>,
}

/// Runs a route's configured filter chain against an external transport,
/// honoring each filter's own circuit breaker and `failure_mode`.
pub struct PluginPipeline {
    transport: Arc<dyn PluginTransport>,
    breakers: Arc<FilterBreakerRegistry>,
}

impl PluginPipeline {
    pub fn new(transport: Arc<dyn PluginTransport>, breakers: Arc<FilterBreakerRegistry>) -> Self {
        Self { transport, breakers }
    }

    pub async fn run_request_phase(
        &self,
        filters: &[PluginFilter],
        input: RequestPhaseInput<'_>,
        now_millis: u64,
    ) -> PhaseOutcome {
        let mut headers = input.headers;
        let mut mutation_denied = false;

        for filter in filters.iter().filter(|f| f.on_request) {
            let body = FilterRequestBody {
                route_id: input.route_id.to_string(),
                phase: "request",
                method: input.method.to_string(),
                uri: input.uri.to_string(),
                host: input.host.to_string(),
                headers: headers.clone(),
                response_status: None,
            };

            match self
                .call_filter(input.route_id, filter, body, filter.request_timeout_ms, now_millis)
                .await
            {
                FilterOutcome::Continue(FilterResponseBody::Continue { set_headers, remove_headers }) => {
                    let result = apply_mutations(&mut headers, &set_headers, &remove_headers);
                    mutation_denied |= !result.denied.is_empty();
                }
                FilterOutcome::Continue(FilterResponseBody::Respond { status, headers: resp_headers, body }) => {
                    return PhaseOutcome::Respond {
                        status,
                        headers: resp_headers,
                        body: body.map(String::into_bytes),
                    };
                }
                FilterOutcome::Skip => {}
                FilterOutcome::FailClosed(category) => return PhaseOutcome::Error(category),
            }
        }

        PhaseOutcome::Continue { headers, mutation_denied }
    }

    pub async fn run_response_phase(
        &self,
        filters: &[PluginFilter],
        input: ResponsePhaseInput<'_>,
        now_millis: u64,
    ) -> PhaseOutcome {
        let mut headers = input.headers;
        let mut mutation_denied = false;

        for filter in filters.iter().filter(|f| f.on_response) {
            let body = FilterRequestBody {
                route_id: input.route_id.to_string(),
                phase: "response",
                method: input.method.to_string(),
                uri: input.uri.to_string(),
                host: input.host.to_string(),
                headers: headers.clone(),
                response_status: Some(input.response_status),
            };

            match self
                .call_filter(input.route_id, filter, body, filter.response_timeout_ms, now_millis)
                .await
            {
                FilterOutcome::Continue(FilterResponseBody::Continue { set_headers, remove_headers }) => {
                    let result = apply_mutations(&mut headers, &set_headers, &remove_headers);
                    mutation_denied |= !result.denied.is_empty();
                }
                FilterOutcome::Continue(FilterResponseBody::Respond { status, headers: resp_headers, body }) => {
                    return PhaseOutcome::Respond {
                        status,
                        headers: resp_headers,
                        body: body.map(String::into_bytes),
                    };
                }
                FilterOutcome::Skip => {}
                FilterOutcome::FailClosed(category) => return PhaseOutcome::Error(category),
            }
        }

        PhaseOutcome::Continue { headers, mutation_denied }
    }

    async fn call_filter(
        &self,
        route_id: &str,
        filter: &PluginFilter,
        body: FilterRequestBody,
        timeout_ms: u64,
        now_millis: u64,
    ) -> FilterOutcome {
        let breaker_key = format!("{route_id}::{}", filter.name);
        let breaker = self.breakers.get(&breaker_key);

        if let Some(b) = &breaker {
            if !b.admit(now_millis) {
                return self.on_unavailable(filter, ErrorCategory::PluginUnavailable);
            }
        }

        match self.transport.call(&filter.addr, body, timeout_ms).await {
            Ok(response) => {
                if let Some(b) = &breaker {
                    b.on_success();
                }
                FilterOutcome::Continue(response)
            }
            Err(TransportError::Timeout) => {
                if let Some(b) = &breaker {
                    b.on_failure(now_millis);
                }
                warn!(filter = %filter.name, "plugin filter timed out");
                self.on_unavailable(filter, ErrorCategory::PluginTimeout)
            }
            Err(TransportError::Unavailable(reason)) => {
                if let Some(b) = &breaker {
                    b.on_failure(now_millis);
                }
                debug!(filter = %filter.name, error = %reason, "plugin filter call failed");
                self.on_unavailable(filter, ErrorCategory::PluginUnavailable)
            }
        }
    }

    fn on_unavailable(&self, filter: &PluginFilter, category: ErrorCategory) -> FilterOutcome {
        match filter.failure_mode {
            FailureMode::FailOpen => FilterOutcome::Skip,
            FailureMode::FailClosed => FilterOutcome::FailClosed(category),
        }
    }
}

enum FilterOutcome {
    Continue(FilterResponseBody),
    Skip,
    FailClosed(ErrorCategory),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysContinue;

    #[async_trait]
    impl PluginTransport for AlwaysContinue {
        async fn call(
            &self,
            _addr: &str,
            _body: FilterRequestBody,
            _timeout_ms: u64,
        ) -> Result<FilterResponseBody, TransportError> {
            Ok(FilterResponseBody::Continue {
                set_headers: HashMap::new(),
                remove_headers: Vec::new(),
            })
        }
    }

    struct AlwaysTimesOut {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PluginTransport for AlwaysTimesOut {
        async fn call(
            &self,
            _addr: &str,
            _body: FilterRequestBody,
            _timeout_ms: u64,
        ) -> Result<FilterResponseBody, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Timeout)
        }
    }

    fn filter(name: &str, failure_mode: FailureMode) -> PluginFilter {
        PluginFilter {
            name: name.to_string(),
            addr: "127.0.0.1:9" .to_string(),
            request_timeout_ms: 100,
            response_timeout_ms: 100,
            failure_mode,
            on_request: true,
            on_response: true,
        }
    }

    #[tokio::test]
    async fn continue_outcome_has_no_denied_mutations() {
        let pipeline = PluginPipeline::new(Arc::new(AlwaysContinue), Arc::new(FilterBreakerRegistry::new()));
        let outcome = pipeline
            .run_request_phase(
                &[filter("f1", FailureMode::FailOpen)],
                RequestPhaseInput {
                    route_id: "r1",
                    method: "GET",
                    uri: "/x",
                    host: "h",
                    headers: HashMap::new(),
                },
                0,
            )
            .await;
        match outcome {
            PhaseOutcome::Continue { mutation_denied, .. } => assert!(!mutation_denied),
            _ => panic!("expected continue"),
        }
    }

    #[tokio::test]
    async fn fail_open_skips_filter_on_timeout() {
        let pipeline = PluginPipeline::new(
            Arc::new(AlwaysTimesOut { calls: AtomicUsize::new(0) }),
            Arc::new(FilterBreakerRegistry::new()),
        );
        let outcome = pipeline
            .run_request_phase(
                &[filter("f1", FailureMode::FailOpen)],
                RequestPhaseInput {
                    route_id: "r1",
                    method: "GET",
                    uri: "/x",
                    host: "h",
                    headers: HashMap::new(),
                },
                0,
            )
            .await;
        assert!(matches!(outcome, PhaseOutcome::Continue { .. }));
    }

    #[tokio::test]
    async fn fail_closed_returns_error_on_timeout() {
        let pipeline = PluginPipeline::new(
            Arc::new(AlwaysTimesOut { calls: AtomicUsize::new(0) }),
            Arc::new(FilterBreakerRegistry::new()),
        );
        let outcome = pipeline
            .run_request_phase(
                &[filter("f1", FailureMode::FailClosed)],
                RequestPhaseInput {
                    route_id: "r1",
                    method: "GET",
                    uri: "/x",
                    host: "h",
                    headers: HashMap::new(),
                },
                0,
            )
            .await;
        assert!(matches!(outcome, PhaseOutcome::Error(ErrorCategory::PluginTimeout)));
    }
}
