//! The data-plane request handler: one orchestrator function that threads a
//! request through limits, routing, traffic splitting, plugins, the circuit
//! breaker, the cache, and the retrying upstream round-trip, emitting one
//! access-log line and one metrics update no matter which path it exits
//! through.

use crate::retry::{resolve_client_cap_key, RetryExecutor, RetryRequest};
use crate::state::ProxyState;
use ando_cache::{
    classify_response, is_cacheable_method, is_cacheable_status, CacheEntry, CacheKey, Coalescer,
    Flight, Partition, ResponseDirective, StartOutcome, WaitOutcome,
};
use ando_core::error::{ErrorCategory, ProxyError};
use ando_observability::access_log::{AccessLogEntry, CacheStatus, CohortMode, TrafficVariant};
use ando_plugin::{PhaseOutcome, RequestPhaseInput, ResponsePhaseInput};
use ando_resilience::Variant;
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Breaker tuning for plugin filters. The route policy has no per-filter
/// breaker knobs (unlike pools), so every filter gets the same fixed
/// threshold rather than inventing config surface the spec doesn't name.
const FILTER_BREAKER_FAILURE_THRESHOLD: u32 = 5;
const FILTER_BREAKER_OPEN_DURATION_MS: u64 = 10_000;
const FILTER_BREAKER_HALF_OPEN_MAX_PROBES: u32 = 1;

/// Connection-level facts the data-plane listener attaches to a request's
/// extensions before it reaches the handler: whether the socket is TLS, and
/// whether a client certificate passed verification. Absent (plain HTTP,
/// or a listener that hasn't been wired up yet) defaults to `false`/`false`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionInfo {
    pub tls: bool,
    pub mtls_verified: bool,
}

pub async fn handle(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let request_id = request_id_of(&req);
    let state_for_panic = state.clone();
    let catch_id = request_id.clone();

    match tokio::spawn(async move {
        let start = Instant::now();
        state.inflight.fetch_add(1, Ordering::AcqRel);
        let response = process(&state, remote_addr, req, request_id, start).await;
        state.inflight.fetch_sub(1, Ordering::AcqRel);
        response
    })
    .await
    {
        Ok(response) => response,
        Err(join_err) => {
            tracing::error!(request_id = %catch_id, panic = %join_err, "proxy handler panicked");
            let err = ProxyError::new(ErrorCategory::Panic, "internal error");
            let body = err.to_json_body(&catch_id);
            let bytes = Bytes::from(serde_json::to_vec(&body).unwrap_or_default());
            let mut headers = HeaderMap::new();
            headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            if let Ok(id) = HeaderValue::from_str(&catch_id) {
                headers.insert(HeaderName::from_static("x-request-id"), id);
            }
            let _ = &state_for_panic;
            build_response(StatusCode::INTERNAL_SERVER_ERROR, headers, bytes)
        }
    }
}

fn request_id_of(req: &Request) -> String {
    if let Some(existing) = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return existing.to_string();
    }
    let bytes: [u8; 16] = rand::random();
    let mut out = String::with_capacity(32);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn epoch_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-request mutable state threaded through the pipeline so every exit
/// path can populate the same access-log entry and metrics update.
struct ReqCtx {
    request_id: String,
    method: String,
    host: String,
    path: String,
    start: Instant,
    route_id: Option<String>,
    pool_key: Option<String>,
    upstream_addr: Option<String>,
    error_category: Option<String>,
    retry_count: u32,
    retry_last_reason: Option<String>,
    retry_budget_exhausted: bool,
    cache_status: CacheStatus,
    snapshot_version: u64,
    snapshot_source: String,
    traffic_variant: Option<TrafficVariant>,
    cohort_mode: Option<CohortMode>,
    cohort_key_present: bool,
    overload_rejected: bool,
    autodrain_active: bool,
    breaker_state: Option<String>,
    breaker_denied: bool,
    outlier_ignored: bool,
    endpoint_ejected: bool,
    tls: bool,
    mtls_route_required: bool,
    mtls_verified: bool,
    redact_query: bool,
    bytes_in: u64,
    bytes_out: u64,
}

impl ReqCtx {
    fn new(request_id: String, method: String, host: String, path: String, tls: bool, mtls_verified: bool, start: Instant) -> Self {
        Self {
            request_id,
            method,
            host,
            path,
            start,
            route_id: None,
            pool_key: None,
            upstream_addr: None,
            error_category: None,
            retry_count: 0,
            retry_last_reason: None,
            retry_budget_exhausted: false,
            cache_status: CacheStatus::Bypass,
            snapshot_version: 0,
            snapshot_source: String::new(),
            traffic_variant: None,
            cohort_mode: None,
            cohort_key_present: false,
            overload_rejected: false,
            autodrain_active: false,
            breaker_state: None,
            breaker_denied: false,
            outlier_ignored: false,
            endpoint_ejected: false,
            tls,
            mtls_route_required: false,
            mtls_verified,
            redact_query: false,
            bytes_in: 0,
            bytes_out: 0,
        }
    }
}

fn cache_status_label(status: CacheStatus) -> &'static str {
    match status {
        CacheStatus::Bypass => "bypass",
        CacheStatus::Miss => "miss",
        CacheStatus::Hit => "hit",
        CacheStatus::CoalesceFollower => "coalesce_follower",
        CacheStatus::CoalesceBreakaway => "coalesce_breakaway",
        CacheStatus::NotCacheable => "not_cacheable",
        CacheStatus::StoreFailed => "store_failed",
    }
}

fn finish(state: &ProxyState, ctx: &ReqCtx, status: StatusCode) {
    let duration = ctx.start.elapsed();
    let route = ctx.route_id.as_deref().unwrap_or("-");
    let pool = ctx.pool_key.as_deref().unwrap_or("-");

    state
        .metrics
        .record_request(route, pool, status.as_u16(), duration.as_secs_f64());
    if ctx.overload_rejected {
        state.metrics.overload_reject_total.with_label_values(&[route]).inc();
    }
    if ctx.breaker_denied {
        state.metrics.circuit_open_total.with_label_values(&[route, pool]).inc();
    }
    if ctx.retry_budget_exhausted {
        state
            .metrics
            .retry_budget_exhausted_total
            .with_label_values(&[route, pool])
            .inc();
    }
    if ctx.retry_count > 0 {
        state
            .metrics
            .retries_total
            .with_label_values(&[route, pool])
            .inc_by(ctx.retry_count as u64);
    }
    if ctx.outlier_ignored {
        state
            .metrics
            .outlier_ejections_total
            .with_label_values(&[route, pool, "bypassed"])
            .inc();
    }
    if ctx.endpoint_ejected {
        state
            .metrics
            .outlier_ejections_total
            .with_label_values(&[route, pool, "ejected"])
            .inc();
    }
    state
        .metrics
        .cache_requests_total
        .with_label_values(&[cache_status_label(ctx.cache_status)])
        .inc();
    if matches!(ctx.cache_status, CacheStatus::CoalesceBreakaway) {
        state.metrics.cache_coalesce_breakaway_total.inc();
    }

    let entry = AccessLogEntry {
        ts: chrono::Utc::now().to_rfc3339(),
        request_id: ctx.request_id.clone(),
        method: ctx.method.clone(),
        host: ctx.host.clone(),
        path: AccessLogEntry::sanitize_path(&ctx.path, ctx.redact_query),
        route_id: ctx.route_id.clone(),
        pool_key: ctx.pool_key.clone(),
        upstream_addr: ctx.upstream_addr.clone(),
        status: status.as_u16(),
        duration_ms: duration.as_millis() as u64,
        bytes_in: ctx.bytes_in,
        bytes_out: ctx.bytes_out,
        error_category: ctx.error_category.clone(),
        retry_count: ctx.retry_count,
        retry_last_reason: ctx.retry_last_reason.clone(),
        retry_budget_exhausted: ctx.retry_budget_exhausted,
        cache_status: ctx.cache_status,
        snapshot_version: ctx.snapshot_version,
        snapshot_source: ctx.snapshot_source.clone(),
        traffic_variant: ctx.traffic_variant,
        cohort_mode: ctx.cohort_mode,
        cohort_key_present: ctx.cohort_key_present,
        overload_rejected: ctx.overload_rejected,
        autodrain_active: ctx.autodrain_active,
        breaker_state: ctx.breaker_state.clone(),
        breaker_denied: ctx.breaker_denied,
        outlier_ignored: ctx.outlier_ignored,
        endpoint_ejected: ctx.endpoint_ejected,
        tls: ctx.tls,
        mtls_route_required: ctx.mtls_route_required,
        mtls_verified: ctx.mtls_verified,
    };
    entry.emit();
}

fn respond(state: &ProxyState, ctx: &mut ReqCtx, status: StatusCode, headers: HeaderMap, body: Bytes) -> Response {
    ctx.bytes_out = body.len() as u64;
    finish(state, ctx, status);
    build_response(status, headers, body)
}

fn respond_error(state: &ProxyState, ctx: &mut ReqCtx, category: ErrorCategory, message: &str) -> Response {
    let err = ProxyError::new(category, message);
    ctx.error_category = Some(category.as_str().to_string());
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = err.to_json_body(&ctx.request_id);
    let bytes = Bytes::from(serde_json::to_vec(&body).unwrap_or_default());
    ctx.bytes_out = bytes.len() as u64;
    finish(state, ctx, status);
    let mut headers = HeaderMap::new();
    headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(id) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert(HeaderName::from_static("x-request-id"), id);
    }
    if matches!(category, ErrorCategory::Overloaded) {
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static("1"));
    }
    build_response(status, headers, bytes)
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response {
    let mut builder = Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    match builder.body(Body::from(body)) {
        Ok(resp) => resp,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn headermap_to_hashmap(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.as_str().to_string(), s.to_string())))
        .collect()
}

fn hashmap_to_headermap(map: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (k, v) in map {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
            headers.insert(name, value);
        }
    }
    headers
}

async fn process(
    state: &ProxyState,
    remote_addr: SocketAddr,
    req: Request,
    request_id: String,
    start: Instant,
) -> Response {
    let (parts, body) = req.into_parts();
    let method = parts.method;
    let uri = parts.uri;
    let headers = parts.headers;
    let path = uri.path().to_string();
    let raw_query = uri.query().map(|s| s.to_string());
    let host = headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let conn_info = parts.extensions.get::<ConnectionInfo>().copied().unwrap_or_default();
    let remote_ip = remote_addr.ip().to_string();

    let mut ctx = ReqCtx::new(
        request_id,
        method.to_string(),
        host.clone(),
        path.clone(),
        conn_info.tls,
        conn_info.mtls_verified,
        start,
    );

    if path.starts_with("/admin") {
        return respond_error(state, &mut ctx, ErrorCategory::NotFound, "not found on the data plane");
    }

    let snap = state.store.acquire();
    ctx.snapshot_version = snap.id;
    ctx.snapshot_source = snap.source.clone();
    ctx.redact_query = snap.logging.redact_query;

    let limits = snap.limits;
    let url_len = path.len() + raw_query.as_ref().map(|q| q.len() + 1).unwrap_or(0);
    if limits.max_url_bytes != 0 && url_len as u64 > limits.max_url_bytes {
        return respond_error(state, &mut ctx, ErrorCategory::UriTooLong, "request URI too long");
    }
    if limits.max_header_count != 0 && headers.len() as u64 > limits.max_header_count {
        return respond_error(state, &mut ctx, ErrorCategory::HeadersTooLarge, "too many request headers");
    }

    let body_limit = if limits.max_body_bytes == 0 { 0usize } else { limits.max_body_bytes as usize };
    let body_bytes = match to_bytes(body, body_limit).await {
        Ok(b) => b,
        Err(_) => return respond_error(state, &mut ctx, ErrorCategory::RequestTooLarge, "request body too large"),
    };
    ctx.bytes_in = body_bytes.len() as u64;

    let Some(route_match) = snap.router.match_route(method.as_str(), &path, &host) else {
        return respond_error(state, &mut ctx, ErrorCategory::NoRoute, "no route matched");
    };
    let route = snap.router.route_at(route_match);
    ctx.route_id = Some(route.id.clone());
    ctx.mtls_route_required = route.policy.require_mtls;

    if route.policy.require_mtls && !conn_info.mtls_verified {
        state.metrics.mtls_reject_total.with_label_values(&[route.id.as_str()]).inc();
        return respond_error(state, &mut ctx, ErrorCategory::MtlsRequired, "client certificate required");
    }

    let mut pool_name = route.pool_name.clone();
    let mut pool_key = route.stable_pool_key.clone();
    let mut variant = Variant::Stable;
    let mut plan = None;
    let mut overload_permit = None;

    if let Some(plan_name) = &route.traffic_plan {
        if let Some(p) = state.registries.traffic.get(plan_name) {
            let cohort_header = p.cohort_header().map(|h| h.to_string());
            let cohort_key = cohort_header
                .as_deref()
                .and_then(|h| headers.get(h))
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            ctx.cohort_key_present = cohort_key.is_some();
            ctx.cohort_mode = Some(if cohort_header.is_some() && cohort_key.is_some() {
                CohortMode::Sticky
            } else {
                CohortMode::Random
            });

            variant = p.choose(cohort_key.as_deref(), epoch_millis());
            ctx.traffic_variant = Some(match variant {
                Variant::Stable => TrafficVariant::Stable,
                Variant::Canary => TrafficVariant::Canary,
            });

            if variant == Variant::Canary {
                if let (Some(canary_name), Some(canary_key)) = (&route.canary_pool_name, &route.canary_pool_key) {
                    pool_name = canary_name.clone();
                    pool_key = canary_key.clone();
                }
            }

            if p.has_overload_limiter() {
                match p.admit().await {
                    Some(permit) => overload_permit = Some(permit),
                    None => {
                        ctx.overload_rejected = true;
                        ctx.pool_key = Some(pool_key.as_str().to_string());
                        return respond_error(state, &mut ctx, ErrorCategory::Overloaded, "overloaded");
                    }
                }
            }
            plan = Some(p);
        }
    }
    ctx.pool_key = Some(pool_key.as_str().to_string());

    let mut outbound_headers = headermap_to_hashmap(&headers);
    if route.policy.plugins.enabled {
        let now = epoch_millis();
        for filter in &route.policy.plugins.filters {
            let key = format!("{}::{}", route.id, filter.name);
            state.plugin_breakers.reconcile(
                &key,
                FILTER_BREAKER_FAILURE_THRESHOLD,
                FILTER_BREAKER_OPEN_DURATION_MS,
                FILTER_BREAKER_HALF_OPEN_MAX_PROBES,
            );
        }
        let outcome = state
            .plugins
            .run_request_phase(
                &route.policy.plugins.filters,
                RequestPhaseInput {
                    route_id: &route.id,
                    method: method.as_str(),
                    uri: &path,
                    host: &host,
                    headers: outbound_headers.clone(),
                },
                now,
            )
            .await;
        match outcome {
            PhaseOutcome::Continue { headers: mutated, .. } => outbound_headers = mutated,
            PhaseOutcome::Respond { status, headers: resp_headers, body } => {
                let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
                return respond(
                    state,
                    &mut ctx,
                    status_code,
                    hashmap_to_headermap(&resp_headers),
                    Bytes::from(body.unwrap_or_default()),
                );
            }
            PhaseOutcome::Error(category) => {
                return respond_error(state, &mut ctx, category, "request plugin rejected the request");
            }
        }
    }
    let forward_headers = hashmap_to_headermap(&outbound_headers);

    let breaker_now = epoch_millis();
    if let Some(breaker) = state.registries.breakers.get(pool_key.as_str()) {
        ctx.breaker_state = Some(format!("{:?}", breaker.state()));
    }
    if !state.registries.breakers.admit(pool_key.as_str(), breaker_now) {
        ctx.breaker_denied = true;
        return respond_error(state, &mut ctx, ErrorCategory::CircuitOpen, "circuit open");
    }

    let cache_enabled = route.policy.cache.enabled && route.policy.cache.ttl_ms > 0;
    let method_cacheable = is_cacheable_method(&method);
    let cache_eligible = cache_enabled && method_cacheable;

    if !cache_enabled {
        ctx.cache_status = CacheStatus::Bypass;
    } else if !method_cacheable {
        ctx.cache_status = CacheStatus::NotCacheable;
    }

    let auth_header = headers.get(http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let partition = Partition::resolve(route.policy.cache.public, auth_header);
    let vary_values: Vec<(String, String)> = route
        .policy
        .cache
        .vary_headers
        .iter()
        .map(|h| {
            let value = headers.get(h).and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
            (h.clone(), value)
        })
        .collect();
    let cache_key = CacheKey::build(method.as_str(), &host, &path, raw_query.as_deref(), &vary_values, &partition);

    let mut leader_flight: Option<Arc<Flight>> = None;
    if cache_eligible {
        match state.cache.get(&cache_key) {
            Some(entry) if entry.is_fresh(epoch_millis()) => {
                ctx.cache_status = CacheStatus::Hit;
                return respond(state, &mut ctx, entry.status, entry.headers.clone(), entry.body.clone());
            }
            Some(_) => state.cache.delete(&cache_key),
            None => {}
        }

        ctx.cache_status = CacheStatus::Miss;
        match state.coalescer.start(cache_key.clone()) {
            StartOutcome::Leader(flight) => leader_flight = Some(flight),
            StartOutcome::Follower(flight) => {
                match Coalescer::wait(&flight, route.policy.cache.coalesce_timeout_ms).await {
                    WaitOutcome::Followed(entry) => {
                        ctx.cache_status = CacheStatus::CoalesceFollower;
                        return respond(state, &mut ctx, entry.status, entry.headers.clone(), entry.body.clone());
                    }
                    WaitOutcome::LeaderMissed => ctx.cache_status = CacheStatus::Miss,
                    WaitOutcome::TimedOut => ctx.cache_status = CacheStatus::CoalesceBreakaway,
                }
            }
        }
    }

    let client_cap_key = if route.policy.client_retry_cap.enabled {
        Some(resolve_client_cap_key(&route.policy.client_retry_cap.key, &remote_ip, &forward_headers))
    } else {
        None
    };
    let path_and_query = match &raw_query {
        Some(q) => format!("{path}?{q}"),
        None => path.clone(),
    };
    let max_eject_percent = snap
        .pool_configs
        .get(&pool_name)
        .map(|c| c.outlier_cfg.max_eject_percent)
        .unwrap_or(100);

    let retry_req = RetryRequest {
        pool_name: pool_name.clone(),
        breaker_key: pool_key.as_str().to_string(),
        route_id: route.id.clone(),
        method: method.clone(),
        path_and_query,
        headers: forward_headers,
        body: body_bytes,
        remote_addr: remote_ip.clone(),
        inbound_tls: conn_info.tls,
        max_eject_percent,
        client_cap_key,
    };

    let deadline = Instant::now() + Duration::from_millis(route.policy.request_timeout_ms);
    let executor = RetryExecutor::new(&state.registries);
    let outcome = executor.execute(&route.policy.retry, &retry_req, deadline, epoch_millis).await;

    ctx.retry_count = outcome.attempts.saturating_sub(1);
    ctx.retry_last_reason = outcome.last_retry_reason;
    ctx.retry_budget_exhausted = outcome.retry_budget_exhausted;
    ctx.upstream_addr = outcome.upstream_addr;
    ctx.outlier_ignored = outcome.outlier_ignored;
    ctx.endpoint_ejected = outcome.endpoint_ejected;

    let upstream_response = match outcome.response {
        Some(resp) => resp,
        None => {
            if let Some(flight) = leader_flight.take() {
                flight.finish(None);
                state.coalescer.retire(&cache_key);
            }
            let category = outcome.error_category.unwrap_or(ErrorCategory::BadGateway);
            return respond_error(state, &mut ctx, category, "upstream request failed");
        }
    };

    let status = upstream_response.status();
    let resp_headers = upstream_response.headers().clone();

    if let Some(p) = &plan {
        p.record_outcome(variant, status.as_u16() >= 500);
    }

    let content_length = resp_headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());
    let is_chunked = resp_headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);
    let is_event_stream = resp_headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false);
    let response_cacheable = cache_eligible
        && is_cacheable_status(status)
        && !is_chunked
        && !is_event_stream
        && content_length.map(|n| n <= route.policy.cache.max_object_bytes).unwrap_or(false);

    let response_body = match upstream_response.bytes().await {
        Ok(b) => b,
        Err(_) => {
            if let Some(flight) = leader_flight.take() {
                flight.finish(None);
                state.coalescer.retire(&cache_key);
            }
            return respond_error(state, &mut ctx, ErrorCategory::BadGateway, "failed reading upstream response body");
        }
    };

    let directive = classify_response(&resp_headers);
    if matches!(directive, ResponseDirective::Invalidate) {
        state.cache.delete(&cache_key);
    }

    if response_cacheable {
        if let ResponseDirective::Store { ttl_override_ms } = directive {
            let now = epoch_millis();
            let ttl_ms = ttl_override_ms.unwrap_or(route.policy.cache.ttl_ms);
            let entry = CacheEntry {
                status,
                headers: resp_headers.clone(),
                body: response_body.clone(),
                stored_at_millis: now,
                expires_at_millis: now + ttl_ms,
            };
            match state.cache.set(cache_key.clone(), entry.clone(), route.policy.cache.max_object_bytes as usize) {
                Ok(()) => {
                    if let Some(flight) = leader_flight.take() {
                        flight.finish(Some(entry));
                        state.coalescer.retire(&cache_key);
                    }
                }
                Err(_) => {
                    ctx.cache_status = CacheStatus::StoreFailed;
                    if let Some(flight) = leader_flight.take() {
                        flight.finish(None);
                        state.coalescer.retire(&cache_key);
                    }
                }
            }
        } else if let Some(flight) = leader_flight.take() {
            flight.finish(None);
            state.coalescer.retire(&cache_key);
        }
    } else if let Some(flight) = leader_flight.take() {
        flight.finish(None);
        state.coalescer.retire(&cache_key);
    }

    let mut final_status = status;
    let mut final_headers = resp_headers.clone();
    let mut final_body = response_body;

    if route.policy.plugins.enabled {
        let outcome = state
            .plugins
            .run_response_phase(
                &route.policy.plugins.filters,
                ResponsePhaseInput {
                    route_id: &route.id,
                    method: method.as_str(),
                    uri: &path,
                    host: &host,
                    response_status: status.as_u16(),
                    headers: headermap_to_hashmap(&resp_headers),
                },
                epoch_millis(),
            )
            .await;
        match outcome {
            PhaseOutcome::Continue { headers: mutated, .. } => final_headers = hashmap_to_headermap(&mutated),
            PhaseOutcome::Respond { status, headers, body } => {
                final_status = StatusCode::from_u16(status).unwrap_or(final_status);
                final_headers = hashmap_to_headermap(&headers);
                final_body = Bytes::from(body.unwrap_or_default());
            }
            PhaseOutcome::Error(category) => {
                return respond_error(state, &mut ctx, category, "response plugin rejected the response");
            }
        }
    }

    let _ = &overload_permit;
    respond(state, &mut ctx, final_status, final_headers, final_body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_accepts_client_supplied_header() {
        let req = Request::builder()
            .header("x-request-id", "client-supplied-id")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_id_of(&req), "client-supplied-id");
    }

    #[test]
    fn request_id_is_generated_when_absent() {
        let req = Request::builder().body(Body::empty()).unwrap();
        let id = request_id_of(&req);
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cache_status_labels_are_distinct() {
        let all = [
            CacheStatus::Bypass,
            CacheStatus::Miss,
            CacheStatus::Hit,
            CacheStatus::CoalesceFollower,
            CacheStatus::CoalesceBreakaway,
            CacheStatus::NotCacheable,
            CacheStatus::StoreFailed,
        ];
        let labels: std::collections::HashSet<&str> = all.iter().map(|s| cache_status_label(*s)).collect();
        assert_eq!(labels.len(), all.len());
    }

    #[test]
    fn hashmap_headermap_round_trip_preserves_ordinary_header() {
        let mut map = HashMap::new();
        map.insert("x-trace".to_string(), "abc".to_string());
        let headers = hashmap_to_headermap(&map);
        assert_eq!(headers.get("x-trace").unwrap(), "abc");
        let back = headermap_to_hashmap(&headers);
        assert_eq!(back.get("x-trace"), Some(&"abc".to_string()));
    }
}
