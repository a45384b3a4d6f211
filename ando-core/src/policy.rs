use crate::config::RoutePolicyConfig;
use crate::error::AndoError;

/// Resolved per-route policy: every duration has a concrete default,
/// every list has its spec-mandated fallback. Built once by the snapshot
/// builder; routes in a compiled snapshot carry this, never the raw config.
#[derive(Debug, Clone)]
pub struct Policy {
    pub request_timeout_ms: u64,
    pub upstream_dial_timeout_ms: u64,
    pub upstream_response_header_timeout_ms: u64,
    pub require_mtls: bool,
    pub retry: RetryPolicy,
    pub retry_budget: RetryBudgetPolicy,
    pub client_retry_cap: ClientRetryCapPolicy,
    pub cache: CachePolicy,
    pub plugins: PluginPolicy,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub per_try_timeout_ms: u64,
    pub backoff_ms: u64,
    pub jitter_ms: u64,
    pub retry_on_status: Vec<u16>,
    pub retry_on_errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RetryBudgetPolicy {
    pub percent: u32,
    pub burst: u32,
}

#[derive(Debug, Clone)]
pub struct ClientRetryCapPolicy {
    pub enabled: bool,
    pub key: ClientCapKey,
    pub lru_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCapKey {
    Ip,
    Header(String),
}

#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl_ms: u64,
    pub max_object_bytes: u64,
    pub vary_headers: Vec<String>,
    pub public: bool,
    pub coalesce_timeout_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PluginPolicy {
    pub enabled: bool,
    pub filters: Vec<PluginFilter>,
}

#[derive(Debug, Clone)]
pub struct PluginFilter {
    pub name: String,
    pub addr: String,
    pub request_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub failure_mode: FailureMode,
    pub on_request: bool,
    pub on_response: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    FailOpen,
    FailClosed,
}

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_DIAL_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_HEADER_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_PER_TRY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_BACKOFF_MS: u64 = 50;
const DEFAULT_JITTER_MS: u64 = 50;
const MAX_FILTER_NAMES: usize = 200;
const MIN_CACHE_OBJECT_BYTES: u64 = 1024;
const MAX_CACHE_OBJECT_BYTES: u64 = 50 * 1024 * 1024;
const MAX_VARY_HEADER_LEN: usize = 128;

impl Policy {
    /// Resolve a raw route policy into the fully-defaulted runtime form.
    /// `route_id` is used only for error messages.
    pub fn compile(route_id: &str, raw: &RoutePolicyConfig) -> Result<Self, AndoError> {
        let retry = Self::compile_retry(&raw.retry);
        let retry_budget = RetryBudgetPolicy {
            percent: raw.retry_budget.percent,
            burst: raw.retry_budget.burst,
        };
        let client_retry_cap = Self::compile_client_cap(route_id, raw)?;
        let cache = Self::compile_cache(route_id, raw)?;
        let plugins = Self::compile_plugins(route_id, raw)?;

        Ok(Self {
            request_timeout_ms: raw.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            upstream_dial_timeout_ms: raw
                .upstream_dial_timeout_ms
                .unwrap_or(DEFAULT_DIAL_TIMEOUT_MS),
            upstream_response_header_timeout_ms: raw
                .upstream_response_header_timeout_ms
                .unwrap_or(DEFAULT_HEADER_TIMEOUT_MS),
            require_mtls: raw.require_mtls,
            retry,
            retry_budget,
            client_retry_cap,
            cache,
            plugins,
        })
    }

    fn compile_retry(raw: &crate::config::RetryPolicyConfig) -> RetryPolicy {
        let retry_on_status = if raw.retry_on_status.is_empty() {
            vec![502, 503, 504]
        } else {
            raw.retry_on_status.clone()
        };
        let retry_on_errors = if raw.retry_on_errors.is_empty() {
            vec!["dial".to_string(), "timeout".to_string()]
        } else {
            raw.retry_on_errors.clone()
        };
        RetryPolicy {
            enabled: raw.enabled,
            max_attempts: raw.max_attempts.max(1),
            per_try_timeout_ms: raw.per_try_timeout_ms.unwrap_or(DEFAULT_PER_TRY_TIMEOUT_MS),
            backoff_ms: raw.backoff_ms.unwrap_or(DEFAULT_BACKOFF_MS),
            jitter_ms: raw.jitter_ms.unwrap_or(DEFAULT_JITTER_MS),
            retry_on_status,
            retry_on_errors,
        }
    }

    fn compile_client_cap(
        route_id: &str,
        raw: &RoutePolicyConfig,
    ) -> Result<ClientRetryCapPolicy, AndoError> {
        let key = match raw.client_retry_cap.key.as_str() {
            "ip" => ClientCapKey::Ip,
            other if other.starts_with("header:") => {
                ClientCapKey::Header(other["header:".len()..].to_string())
            }
            other => {
                return Err(AndoError::InvalidRoute {
                    route_id: route_id.to_string(),
                    reason: format!("invalid client_retry_cap.key {other:?}"),
                })
            }
        };
        Ok(ClientRetryCapPolicy {
            enabled: raw.client_retry_cap.enabled,
            key,
            lru_size: raw.client_retry_cap.lru_size,
        })
    }

    fn compile_cache(
        route_id: &str,
        raw: &RoutePolicyConfig,
    ) -> Result<CachePolicy, AndoError> {
        let c = &raw.cache;
        if c.enabled && c.ttl_ms == 0 {
            return Err(AndoError::InvalidRoute {
                route_id: route_id.to_string(),
                reason: "cache.enabled requires ttl_ms > 0".into(),
            });
        }
        if c.max_object_bytes < MIN_CACHE_OBJECT_BYTES || c.max_object_bytes > MAX_CACHE_OBJECT_BYTES
        {
            return Err(AndoError::InvalidRoute {
                route_id: route_id.to_string(),
                reason: format!(
                    "cache.max_object_bytes {} out of range [{},{}]",
                    c.max_object_bytes, MIN_CACHE_OBJECT_BYTES, MAX_CACHE_OBJECT_BYTES
                ),
            });
        }
        let vary_headers = c
            .vary_headers
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty() && h.is_ascii() && h.len() <= MAX_VARY_HEADER_LEN)
            .collect();

        Ok(CachePolicy {
            enabled: c.enabled,
            ttl_ms: c.ttl_ms,
            max_object_bytes: c.max_object_bytes,
            vary_headers,
            public: c.public,
            coalesce_timeout_ms: c.coalesce_timeout_ms,
        })
    }

    fn compile_plugins(
        route_id: &str,
        raw: &RoutePolicyConfig,
    ) -> Result<PluginPolicy, AndoError> {
        let p = &raw.plugins;
        if p.enabled && p.filters.is_empty() {
            return Err(AndoError::InvalidRoute {
                route_id: route_id.to_string(),
                reason: "plugins.enabled requires at least one filter".into(),
            });
        }
        if p.filters.len() > MAX_FILTER_NAMES {
            return Err(AndoError::InvalidRoute {
                route_id: route_id.to_string(),
                reason: format!("more than {MAX_FILTER_NAMES} distinct plugin filters"),
            });
        }
        let mut filters = Vec::with_capacity(p.filters.len());
        for f in &p.filters {
            if f.name.is_empty() {
                return Err(AndoError::InvalidRoute {
                    route_id: route_id.to_string(),
                    reason: "plugin filter missing name".into(),
                });
            }
            if f.addr.split(':').count() < 2 {
                return Err(AndoError::InvalidRoute {
                    route_id: route_id.to_string(),
                    reason: format!("plugin filter {} addr must be host:port", f.name),
                });
            }
            let failure_mode = match f.failure_mode.as_str() {
                "fail_open" => FailureMode::FailOpen,
                "fail_closed" => FailureMode::FailClosed,
                other => {
                    return Err(AndoError::InvalidRoute {
                        route_id: route_id.to_string(),
                        reason: format!("plugin filter {} invalid failure_mode {other:?}", f.name),
                    })
                }
            };
            filters.push(PluginFilter {
                name: f.name.clone(),
                addr: f.addr.clone(),
                request_timeout_ms: f.request_timeout_ms,
                response_timeout_ms: f.response_timeout_ms,
                failure_mode,
                on_request: f.on_request,
                on_response: f.on_response,
            });
        }
        Ok(PluginPolicy {
            enabled: p.enabled,
            filters,
        })
    }
}
