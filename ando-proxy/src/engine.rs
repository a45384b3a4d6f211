use ando_core::error::ErrorCategory;
use ando_resilience::{PickResult, Registries};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method};
use std::time::Instant;

/// Everything the engine needs for one upstream attempt. Built fresh by the
/// retry executor for every try (the URL path/headers are cheap to clone;
/// the body is an `Arc`-backed `Bytes` so retries never re-read it).
pub struct AttemptContext {
    pub pool_name: String,
    pub breaker_key: String,
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: String,
    pub inbound_tls: bool,
    pub max_eject_percent: u32,
    pub timeout_ms: u64,
}

pub struct AttemptOutcome {
    pub upstream_addr: Option<String>,
    pub response: Option<reqwest::Response>,
    pub latency_ms: u64,
    pub error_category: Option<ErrorCategory>,
    pub pick: Option<PickResult>,
}

/// Performs one upstream round-trip: pick endpoint, forward the request,
/// report the outcome to the breaker and outlier registries. Stateless —
/// all mutable state lives in `Registries`.
pub struct Engine<'a> {
    registries: &'a Registries,
}

impl<'a> Engine<'a> {
    pub fn new(registries: &'a Registries) -> Self {
        Self { registries }
    }

    pub async fn attempt(&self, ctx: &AttemptContext, now_millis: u64) -> AttemptOutcome {
        let pool = match self.registries.pools.get(&ctx.pool_name) {
            Some(p) => p,
            None => {
                return AttemptOutcome {
                    upstream_addr: None,
                    response: None,
                    latency_ms: 0,
                    error_category: Some(ErrorCategory::BadGateway),
                    pick: None,
                }
            }
        };
        let transport = match self.registries.transports.get(&ctx.pool_name) {
            Some(t) => t,
            None => {
                return AttemptOutcome {
                    upstream_addr: None,
                    response: None,
                    latency_ms: 0,
                    error_category: Some(ErrorCategory::BadGateway),
                    pick: None,
                }
            }
        };

        let pool_name = ctx.pool_name.clone();
        let pick = pool.pick(
            |addr, now| self.registries.outliers.is_ejected(&pool_name, addr, now),
            ctx.max_eject_percent,
            now_millis,
        );
        let pick = match pick {
            Some(p) => p,
            None => {
                return AttemptOutcome {
                    upstream_addr: None,
                    response: None,
                    latency_ms: 0,
                    error_category: Some(ErrorCategory::BadGateway),
                    pick: None,
                }
            }
        };

        pool.incr_inflight(&pick.addr);

        let url = format!("http://{}{}", pick.addr, ctx.path_and_query);
        let mut headers = ctx.headers.clone();
        apply_forwarded_headers(&mut headers, &ctx.remote_addr, ctx.inbound_tls);

        let start = Instant::now();
        let send = transport
            .client
            .request(ctx.method.clone(), &url)
            .headers(headers)
            .body(ctx.body.clone())
            .send();

        let result = tokio::time::timeout(std::time::Duration::from_millis(ctx.timeout_ms), send).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let (response, error_category, failed) = match result {
            Ok(Ok(resp)) => {
                let failed = resp.status().as_u16() >= 500;
                (Some(resp), None, failed)
            }
            Ok(Err(err)) => {
                let category = if err.is_connect() {
                    ErrorCategory::UpstreamConnectFailed
                } else if err.is_timeout() {
                    ErrorCategory::UpstreamTimeout
                } else {
                    ErrorCategory::BadGateway
                };
                (None, Some(category), true)
            }
            Err(_elapsed) => (None, Some(ErrorCategory::UpstreamTimeout), true),
        };

        self.registries
            .outliers
            .record(&ctx.pool_name, &pick.addr, failed, latency_ms, now_millis);
        if failed {
            self.registries.breakers.on_failure(&ctx.breaker_key, now_millis);
            pool.report_failure(&pick.addr, now_millis);
        } else {
            self.registries.breakers.on_success(&ctx.breaker_key, now_millis);
            pool.report_success(&pick.addr);
        }

        pool.decr_inflight(&pick.addr);

        AttemptOutcome {
            upstream_addr: Some(pick.addr.clone()),
            response,
            latency_ms,
            error_category,
            pick: Some(pick),
        }
    }
}

fn apply_forwarded_headers(headers: &mut HeaderMap, remote_addr: &str, inbound_tls: bool) {
    let forwarded_for = match headers.get("x-forwarded-for") {
        Some(existing) => format!("{}, {}", existing.to_str().unwrap_or(""), remote_addr),
        None => remote_addr.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    let proto = if inbound_tls { "https" } else { "http" };
    headers.insert("x-forwarded-proto", HeaderValue::from_static(proto));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_appends_to_existing_value() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        apply_forwarded_headers(&mut headers, "203.0.113.5", false);
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.1, 203.0.113.5");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
    }

    #[test]
    fn forwarded_proto_reflects_inbound_tls() {
        let mut headers = HeaderMap::new();
        apply_forwarded_headers(&mut headers, "203.0.113.5", true);
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.5");
    }
}
