use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration for the proxy node.
///
/// This is the raw, user-authored shape. None of it is validated here —
/// validation and default resolution is the snapshot builder's job
/// (`ando-proxy::builder::SnapshotBuilder`); loading a config that later
/// fails to build a snapshot is not itself an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AndoConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Named backend pools, keyed by pool name.
    #[serde(default)]
    pub pools: HashMap<String, PoolConfig>,

    /// Routes in declaration order — order is significant (first-match-wins).
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Named traffic plans, referenced by routes.
    #[serde(default)]
    pub traffic_plans: HashMap<String, TrafficPlanConfig>,

    #[serde(default)]
    pub config_source: ConfigSourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    #[serde(default)]
    pub workers: usize,

    #[serde(default = "default_graceful_timeout_ms")]
    pub graceful_timeout_ms: u64,

    #[serde(default = "default_drain_ms")]
    pub drain_ms: u64,

    #[serde(default = "default_force_close_ms")]
    pub force_close_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            workers: 0,
            graceful_timeout_ms: default_graceful_timeout_ms(),
            drain_ms: default_drain_ms(),
            force_close_ms: default_force_close_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_addr")]
    pub addr: SocketAddr,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            addr: default_admin_addr(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,

    /// Client CA bundle; presence is what "mTLS configured" means.
    #[serde(default)]
    pub client_ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    #[serde(default)]
    pub victoria_metrics: VictoriaMetricsConfig,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            prometheus: PrometheusConfig::default(),
            victoria_metrics: VictoriaMetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VictoriaMetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_vm_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_push_interval")]
    pub push_interval_secs: u64,
}

impl Default for VictoriaMetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_vm_endpoint(),
            push_interval_secs: default_push_interval(),
        }
    }
}

/// Request limits enforced by the handler before routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub max_url_bytes: Option<u64>,
    #[serde(default)]
    pub max_header_count: Option<u64>,
    #[serde(default)]
    pub max_body_bytes: Option<u64>,
    #[serde(default)]
    pub read_header_timeout_ms: Option<u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_url_bytes: None,
            max_header_count: None,
            max_body_bytes: None,
            read_header_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub redact_query: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            redact_query: false,
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSourceConfig {
    /// Path to a YAML bundle file supplying routes/pools at runtime, in
    /// addition to what this process config carries inline. Optional —
    /// the inline sections above are always the base.
    #[serde(default)]
    pub bundle_file: Option<PathBuf>,
}

impl Default for ConfigSourceConfig {
    fn default() -> Self {
        Self { bundle_file: None }
    }
}

/// A named backend pool: its endpoint list plus resilience defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub endpoints: Vec<String>,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub outlier: OutlierConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub passive_health: PassiveHealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold_percent: u32,
    #[serde(default = "default_min_requests")]
    pub min_requests: u32,
    #[serde(default = "default_eval_window_ms")]
    pub evaluation_window_ms: u64,
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold_percent: default_failure_threshold(),
            min_requests: default_min_requests(),
            evaluation_window_ms: default_eval_window_ms(),
            open_duration_ms: default_open_duration_ms(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlierConfig {
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures: u32,
    #[serde(default = "default_error_rate_percent")]
    pub error_rate_percent: u32,
    #[serde(default = "default_error_rate_min_requests")]
    pub error_rate_min_requests: u32,
    #[serde(default = "default_latency_window_size")]
    pub latency_window_size: usize,
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,
    #[serde(default = "default_base_eject_ms")]
    pub base_eject_ms: u64,
    #[serde(default = "default_max_eject_ms")]
    pub max_eject_ms: u64,
    #[serde(default = "default_max_eject_percent")]
    pub max_eject_percent: u32,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: default_consecutive_failures(),
            error_rate_percent: default_error_rate_percent(),
            error_rate_min_requests: default_error_rate_min_requests(),
            latency_window_size: default_latency_window_size(),
            latency_threshold_ms: default_latency_threshold_ms(),
            base_eject_ms: default_base_eject_ms(),
            max_eject_ms: default_max_eject_ms(),
            max_eject_percent: default_max_eject_percent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_pool_idle_timeout_ms")]
    pub pool_idle_timeout_ms: u64,
    #[serde(default = "default_drain_ttl_ms")]
    pub drain_ttl_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            pool_idle_timeout_ms: default_pool_idle_timeout_ms(),
            drain_ttl_ms: default_drain_ttl_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassiveHealthConfig {
    #[serde(default = "default_unhealthy_after_failures")]
    pub unhealthy_after_failures: u32,
    #[serde(default = "default_healthy_after_successes")]
    pub healthy_after_successes: u32,
    #[serde(default = "default_base_eject_ms")]
    pub base_eject_ms: u64,
    #[serde(default = "default_max_eject_ms")]
    pub max_eject_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for PassiveHealthConfig {
    fn default() -> Self {
        Self {
            unhealthy_after_failures: default_unhealthy_after_failures(),
            healthy_after_successes: default_healthy_after_successes(),
            base_eject_ms: default_base_eject_ms(),
            max_eject_ms: default_max_eject_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// A route as authored by the operator. `RouteConfig::compile` turns this,
/// plus pool defaults, into a `crate::route::CompiledRoute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,

    #[serde(default)]
    pub host: String,

    pub path_prefix: String,

    #[serde(default)]
    pub methods: Vec<String>,

    pub pool: String,

    #[serde(default)]
    pub canary_pool: Option<String>,

    #[serde(default)]
    pub traffic_plan: Option<String>,

    #[serde(default)]
    pub policy: RoutePolicyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutePolicyConfig {
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub upstream_dial_timeout_ms: Option<u64>,
    #[serde(default)]
    pub upstream_response_header_timeout_ms: Option<u64>,
    #[serde(default)]
    pub require_mtls: bool,
    #[serde(default)]
    pub retry: RetryPolicyConfig,
    #[serde(default)]
    pub retry_budget: RetryBudgetPolicyConfig,
    #[serde(default)]
    pub client_retry_cap: ClientRetryCapPolicyConfig,
    #[serde(default)]
    pub cache: CachePolicyConfig,
    #[serde(default)]
    pub plugins: PluginPolicyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub per_try_timeout_ms: Option<u64>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
    #[serde(default)]
    pub jitter_ms: Option<u64>,
    #[serde(default)]
    pub retry_on_status: Vec<u16>,
    #[serde(default)]
    pub retry_on_errors: Vec<String>,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            per_try_timeout_ms: None,
            backoff_ms: None,
            jitter_ms: None,
            retry_on_status: vec![],
            retry_on_errors: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryBudgetPolicyConfig {
    #[serde(default = "default_budget_percent")]
    pub percent: u32,
    #[serde(default = "default_budget_burst")]
    pub burst: u32,
}

impl Default for RetryBudgetPolicyConfig {
    fn default() -> Self {
        Self {
            percent: default_budget_percent(),
            burst: default_budget_burst(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRetryCapPolicyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_client_cap_key")]
    pub key: String,
    #[serde(default = "default_lru_size")]
    pub lru_size: usize,
}

impl Default for ClientRetryCapPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key: default_client_cap_key(),
            lru_size: default_lru_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePolicyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ttl_ms: u64,
    #[serde(default = "default_max_object_bytes")]
    pub max_object_bytes: u64,
    #[serde(default)]
    pub vary_headers: Vec<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default = "default_coalesce_timeout_ms")]
    pub coalesce_timeout_ms: u64,
}

impl Default for CachePolicyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_ms: 0,
            max_object_bytes: default_max_object_bytes(),
            vary_headers: vec![],
            public: false,
            coalesce_timeout_ms: default_coalesce_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginPolicyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub filters: Vec<PluginFilterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginFilterConfig {
    pub name: String,
    pub addr: String,
    #[serde(default = "default_plugin_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_plugin_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_failure_mode")]
    pub failure_mode: String,
    #[serde(default)]
    pub on_request: bool,
    #[serde(default)]
    pub on_response: bool,
}

/// Traffic plan: split + optional cohort + optional overload limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficPlanConfig {
    #[serde(default = "default_stable_weight")]
    pub stable_weight: u32,
    #[serde(default)]
    pub canary_weight: u32,

    #[serde(default)]
    pub cohort: Option<String>,

    #[serde(default)]
    pub overload: Option<OverloadLimiterConfig>,

    #[serde(default)]
    pub autodrain: Option<AutoDrainConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverloadLimiterConfig {
    pub max_inflight: usize,
    #[serde(default)]
    pub max_queue: usize,
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoDrainConfig {
    #[serde(default = "default_autodrain_min_requests")]
    pub min_requests: u64,
    #[serde(default = "default_autodrain_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_autodrain_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_autodrain_cooloff_ms")]
    pub cooloff_ms: u64,
}

impl AndoConfig {
    /// Load configuration from YAML file + environment variable overrides.
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["ando.yaml", "/etc/ando/ando.yaml", "config/ando.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        figment = figment.merge(Env::prefixed("ANDO_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }
}

// Serde default functions

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_http_addr() -> SocketAddr {
    "0.0.0.0:9080".parse().unwrap()
}
fn default_admin_addr() -> SocketAddr {
    "127.0.0.1:9180".parse().unwrap()
}
fn default_true() -> bool {
    true
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}
fn default_vm_endpoint() -> String {
    "http://127.0.0.1:8428/api/v1/write".to_string()
}
fn default_push_interval() -> u64 {
    15
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_graceful_timeout_ms() -> u64 {
    30_000
}
fn default_drain_ms() -> u64 {
    2_000
}
fn default_force_close_ms() -> u64 {
    5_000
}
fn default_failure_threshold() -> u32 {
    50
}
fn default_min_requests() -> u32 {
    10
}
fn default_eval_window_ms() -> u64 {
    10_000
}
fn default_open_duration_ms() -> u64 {
    30_000
}
fn default_half_open_max_probes() -> u32 {
    1
}
fn default_consecutive_failures() -> u32 {
    5
}
fn default_error_rate_percent() -> u32 {
    50
}
fn default_error_rate_min_requests() -> u32 {
    10
}
fn default_latency_window_size() -> usize {
    32
}
fn default_latency_threshold_ms() -> u64 {
    1_000
}
fn default_base_eject_ms() -> u64 {
    1_000
}
fn default_max_eject_ms() -> u64 {
    300_000
}
fn default_max_eject_percent() -> u32 {
    50
}
fn default_connect_timeout_ms() -> u64 {
    6_000
}
fn default_pool_idle_timeout_ms() -> u64 {
    90_000
}
fn default_drain_ttl_ms() -> u64 {
    10_000
}
fn default_unhealthy_after_failures() -> u32 {
    3
}
fn default_healthy_after_successes() -> u32 {
    2
}
fn default_drain_timeout_ms() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    1
}
fn default_budget_percent() -> u32 {
    10
}
fn default_budget_burst() -> u32 {
    5
}
fn default_client_cap_key() -> String {
    "ip".to_string()
}
fn default_lru_size() -> usize {
    4096
}
fn default_max_object_bytes() -> u64 {
    1024 * 1024
}
fn default_coalesce_timeout_ms() -> u64 {
    5_000
}
fn default_plugin_timeout_ms() -> u64 {
    1_000
}
fn default_failure_mode() -> String {
    "fail_open".to_string()
}
fn default_stable_weight() -> u32 {
    100
}
fn default_queue_timeout_ms() -> u64 {
    0
}
fn default_autodrain_min_requests() -> u64 {
    20
}
fn default_autodrain_multiplier() -> f64 {
    2.0
}
fn default_autodrain_window_ms() -> u64 {
    10_000
}
fn default_autodrain_cooloff_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_listener() {
        let cfg = AndoConfig {
            node_id: default_node_id(),
            proxy: ProxyConfig::default(),
            admin: AdminConfig::default(),
            observability: ObservabilityConfig::default(),
            limits: LimitsConfig::default(),
            logging: LoggingConfig::default(),
            tls: None,
            pools: HashMap::new(),
            routes: vec![],
            traffic_plans: HashMap::new(),
            config_source: ConfigSourceConfig::default(),
        };
        assert_eq!(cfg.proxy.http_addr.port(), 9080);
        assert_eq!(cfg.admin.addr.port(), 9180);
        assert!(cfg.tls.is_none());
    }

    #[test]
    fn breaker_defaults_match_spec_example() {
        let b = BreakerConfig::default();
        assert_eq!(b.failure_threshold_percent, 50);
        assert!(b.evaluation_window_ms > 0);
    }

    #[test]
    fn parses_minimal_yaml() {
        let yaml = r#"
pools:
  p1:
    endpoints: ["127.0.0.1:8080"]
routes:
  - id: r1
    path_prefix: /
    pool: p1
"#;
        let cfg: AndoConfig = Figment::new()
            .merge(figment::providers::Yaml::string(yaml))
            .extract()
            .unwrap();
        assert_eq!(cfg.routes.len(), 1);
        assert_eq!(cfg.pools["p1"].endpoints[0], "127.0.0.1:8080");
    }
}
