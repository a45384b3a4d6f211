//! Structured per-request access log entry.
//!
//! One JSON object per request, emitted at `info` on the `ando::access`
//! tracing target as a single event — independent of the free-form
//! application log stream.

use crate::redact::{redact_header_value, scrub_query};
use serde::Serialize;

/// Which side of the stable/canary split served the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficVariant {
    Stable,
    Canary,
}

/// How the traffic plan picked a variant for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortMode {
    Sticky,
    Random,
}

/// Outcome of the cache lookup for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Bypass,
    Miss,
    Hit,
    CoalesceFollower,
    CoalesceBreakaway,
    NotCacheable,
    StoreFailed,
}

/// One fully-populated access log record, per spec §6's field list.
#[derive(Debug, Serialize)]
pub struct AccessLogEntry {
    pub ts: String,
    pub request_id: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub route_id: Option<String>,
    pub pool_key: Option<String>,
    pub upstream_addr: Option<String>,
    pub status: u16,
    pub duration_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub error_category: Option<String>,
    pub retry_count: u32,
    pub retry_last_reason: Option<String>,
    pub retry_budget_exhausted: bool,
    pub cache_status: CacheStatus,
    pub snapshot_version: u64,
    pub snapshot_source: String,
    pub traffic_variant: Option<TrafficVariant>,
    pub cohort_mode: Option<CohortMode>,
    pub cohort_key_present: bool,
    pub overload_rejected: bool,
    pub autodrain_active: bool,
    pub breaker_state: Option<String>,
    pub breaker_denied: bool,
    pub outlier_ignored: bool,
    pub endpoint_ejected: bool,
    pub tls: bool,
    pub mtls_route_required: bool,
    pub mtls_verified: bool,
}

impl AccessLogEntry {
    /// Redacts sensitive query parameters when logging the full path, or
    /// drops the query entirely when `redact_query` is set.
    pub fn sanitize_path(path: &str, redact_query: bool) -> String {
        if redact_query {
            match path.split_once('?') {
                Some((p, _)) => p.to_string(),
                None => path.to_string(),
            }
        } else {
            scrub_query(path)
        }
    }

    /// Emits this entry as a single structured `tracing` event on the
    /// `ando::access` target.
    pub fn emit(&self) {
        let body = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(target: "ando::access", access_log = %body);
    }
}

/// Redacts a single forwarded header value before it is ever placed in a log
/// field or propagated — thin wrapper kept here so call sites in
/// `ando-proxy` don't need to depend on the `redact` module directly.
pub fn redact_if_sensitive(name: &str, value: &str) -> String {
    redact_header_value(name, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_query_strips_query_string() {
        assert_eq!(
            AccessLogEntry::sanitize_path("/v1/users?token=abc", true),
            "/v1/users"
        );
    }

    #[test]
    fn non_redacted_query_is_scrubbed_not_dropped() {
        let out = AccessLogEntry::sanitize_path("/v1/users?authorization=Bearer+x", false);
        assert!(out.contains("/v1/users"));
    }

    #[test]
    fn path_without_query_is_unchanged() {
        assert_eq!(AccessLogEntry::sanitize_path("/v1/users", false), "/v1/users");
        assert_eq!(AccessLogEntry::sanitize_path("/v1/users", true), "/v1/users");
    }
}
