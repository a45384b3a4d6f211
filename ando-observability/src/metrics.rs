use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Prometheus registry and the full metric set named by spec §6: request
/// totals, upstream roundtrip duration, retries, retry-budget exhaustion,
/// circuit-open events, breaker state, outlier ejections by reason, cache
/// requests by status, cache coalesce breakaway, overload reject, plugin
/// calls by (filter, phase, result), plugin short-circuit, plugin
/// fail-closed, mTLS reject, rollback total, config apply by outcome. Labels
/// are kept to `{route, pool, status}` and the narrow per-metric extras
/// spec names — never free-form strings — to stay low-cardinality.
pub struct MetricsCollector {
    registry: Registry,

    pub requests_total: IntCounterVec,
    pub upstream_duration: HistogramVec,
    pub retries_total: IntCounterVec,
    pub retry_budget_exhausted_total: IntCounterVec,
    pub circuit_open_total: IntCounterVec,
    pub breaker_state: IntGaugeVec,
    pub outlier_ejections_total: IntCounterVec,
    pub cache_requests_total: IntCounterVec,
    pub cache_coalesce_breakaway_total: IntCounter,
    pub overload_reject_total: IntCounterVec,
    pub plugin_calls_total: IntCounterVec,
    pub plugin_short_circuit_total: IntCounterVec,
    pub plugin_fail_closed_total: IntCounterVec,
    pub mtls_reject_total: IntCounterVec,
    pub rollback_total: IntCounter,
    pub config_apply_total: IntCounterVec,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("ando_requests_total", "Total proxied requests").namespace("ando"),
            &["route", "pool", "status"],
        )?;

        let upstream_duration = HistogramVec::new(
            HistogramOpts::new(
                "ando_upstream_duration_seconds",
                "Upstream round-trip duration",
            )
            .namespace("ando")
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["route", "pool", "status"],
        )?;

        let retries_total = IntCounterVec::new(
            Opts::new("ando_retries_total", "Retried attempts").namespace("ando"),
            &["route", "pool"],
        )?;

        let retry_budget_exhausted_total = IntCounterVec::new(
            Opts::new(
                "ando_retry_budget_exhausted_total",
                "Retries denied by an exhausted retry budget",
            )
            .namespace("ando"),
            &["route", "pool"],
        )?;

        let circuit_open_total = IntCounterVec::new(
            Opts::new("ando_circuit_open_total", "Breaker open transitions").namespace("ando"),
            &["route", "pool"],
        )?;

        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "ando_breaker_state",
                "Current breaker state (0=closed 1=open 2=half_open)",
            )
            .namespace("ando"),
            &["route", "pool"],
        )?;

        let outlier_ejections_total = IntCounterVec::new(
            Opts::new("ando_outlier_ejections_total", "Endpoint outlier ejections")
                .namespace("ando"),
            &["route", "pool", "reason"],
        )?;

        let cache_requests_total = IntCounterVec::new(
            Opts::new("ando_cache_requests_total", "Cache lookups by outcome").namespace("ando"),
            &["status"],
        )?;

        let cache_coalesce_breakaway_total = IntCounter::with_opts(
            Opts::new(
                "ando_cache_coalesce_breakaway_total",
                "Single-flight followers that broke away after the leader stalled",
            )
            .namespace("ando"),
        )?;

        let overload_reject_total = IntCounterVec::new(
            Opts::new("ando_overload_reject_total", "Requests rejected for overload")
                .namespace("ando"),
            &["route"],
        )?;

        let plugin_calls_total = IntCounterVec::new(
            Opts::new("ando_plugin_calls_total", "Plugin filter invocations").namespace("ando"),
            &["filter", "phase", "result"],
        )?;

        let plugin_short_circuit_total = IntCounterVec::new(
            Opts::new(
                "ando_plugin_short_circuit_total",
                "Plugin RESPOND actions that short-circuited the pipeline",
            )
            .namespace("ando"),
            &["filter"],
        )?;

        let plugin_fail_closed_total = IntCounterVec::new(
            Opts::new(
                "ando_plugin_fail_closed_total",
                "Plugin failures that rejected the request (fail_closed)",
            )
            .namespace("ando"),
            &["filter"],
        )?;

        let mtls_reject_total = IntCounterVec::new(
            Opts::new("ando_mtls_reject_total", "Requests rejected for missing client cert")
                .namespace("ando"),
            &["route"],
        )?;

        let rollback_total = IntCounter::with_opts(
            Opts::new("ando_rollback_total", "Config rollbacks applied").namespace("ando"),
        )?;

        let config_apply_total = IntCounterVec::new(
            Opts::new("ando_config_apply_total", "Config apply attempts by outcome")
                .namespace("ando"),
            &["outcome"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(upstream_duration.clone()))?;
        registry.register(Box::new(retries_total.clone()))?;
        registry.register(Box::new(retry_budget_exhausted_total.clone()))?;
        registry.register(Box::new(circuit_open_total.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;
        registry.register(Box::new(outlier_ejections_total.clone()))?;
        registry.register(Box::new(cache_requests_total.clone()))?;
        registry.register(Box::new(cache_coalesce_breakaway_total.clone()))?;
        registry.register(Box::new(overload_reject_total.clone()))?;
        registry.register(Box::new(plugin_calls_total.clone()))?;
        registry.register(Box::new(plugin_short_circuit_total.clone()))?;
        registry.register(Box::new(plugin_fail_closed_total.clone()))?;
        registry.register(Box::new(mtls_reject_total.clone()))?;
        registry.register(Box::new(rollback_total.clone()))?;
        registry.register(Box::new(config_apply_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            upstream_duration,
            retries_total,
            retry_budget_exhausted_total,
            circuit_open_total,
            breaker_state,
            outlier_ejections_total,
            cache_requests_total,
            cache_coalesce_breakaway_total,
            overload_reject_total,
            plugin_calls_total,
            plugin_short_circuit_total,
            plugin_fail_closed_total,
            mtls_reject_total,
            rollback_total,
            config_apply_total,
        })
    }

    /// Records one completed request's top-level counters. Per-concern
    /// counters (retries, outlier ejections, plugin calls, ...) are recorded
    /// directly against their fields by the call sites that observe them.
    pub fn record_request(&self, route: &str, pool: &str, status: u16, duration_secs: f64) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[route, pool, &status])
            .inc();
        self.upstream_duration
            .with_label_values(&[route, pool, &status])
            .observe(duration_secs);
    }

    /// Prometheus text exposition for the `/metrics` scrape endpoint.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metrics, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("failed to construct metrics registry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_request("r1", "p1", 200, 0.012);
        let text = collector.gather_text();
        assert!(text.contains("ando_requests_total"));
        assert!(text.contains("ando_upstream_duration_seconds"));
    }

    #[test]
    fn distinct_metric_families_are_registered() {
        let collector = MetricsCollector::new().unwrap();
        collector.outlier_ejections_total.with_label_values(&["r1", "p1", "latency"]).inc();
        collector.plugin_calls_total.with_label_values(&["auth", "request", "continue"]).inc();
        let text = collector.gather_text();
        assert!(text.contains("ando_outlier_ejections_total"));
        assert!(text.contains("ando_plugin_calls_total"));
    }
}
