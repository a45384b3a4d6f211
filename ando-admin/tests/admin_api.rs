//! Integration tests for the Admin REST API handlers.
//!
//! Uses `tower::ServiceExt::oneshot` to call handlers without binding a real
//! TCP port — every test gets a fresh in-memory state.

use ando_admin::{build_admin_router, AdminState};
use ando_cache::{CacheStore, Coalescer};
use ando_core::config::LoggingConfig;
use ando_core::{Limits, Router, Snapshot, SnapshotStore};
use ando_observability::metrics::MetricsCollector;
use ando_plugin::{
    FilterBreakerRegistry, FilterRequestBody, FilterResponseBody, PluginPipeline, PluginTransport,
    TransportError,
};
use ando_proxy::ProxyState;
use ando_resilience::Registries;
use ando_store::ConfigSource;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tower::ServiceExt;

struct NoopTransport;

#[async_trait]
impl PluginTransport for NoopTransport {
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

fn empty_snapshot(id: u64) -> Arc<Snapshot> {
    Arc::new(Snapshot::new(
        id,
        format!("v{id}"),
        "test".into(),
        chrono::Utc::now(),
        Router::new(vec![]),
        HashMap::new(),
        HashMap::new(),
        None,
        Limits::default(),
        LoggingConfig::default(),
    ))
}

fn test_state() -> Arc<AdminState> {
    let store = SnapshotStore::new(empty_snapshot(1));
    let registries = Registries::new();
    let breakers = Arc::new(FilterBreakerRegistry::new());
    let proxy_state = Arc::new(ProxyState {
        store,
        registries,
        cache: CacheStore::new(),
        coalescer: Coalescer::new(),
        plugins: PluginPipeline::new(Arc::new(NoopTransport), breakers.clone()),
        plugin_breakers: breakers,
        metrics: MetricsCollector::new().expect("metrics collector"),
        inflight: AtomicU64::new(0),
    });
    let config_source = Arc::new(ConfigSource::new(None));
    Arc::new(AdminState::new(proxy_state, config_source))
}

fn empty_config_yaml() -> &'static [u8] {
    b"{}"
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthz_reports_current_snapshot() {
    let state = test_state();
    let app = build_admin_router(state);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["snapshot_version"], 1);
    assert_eq!(json["under_pressure"], false);
}

#[tokio::test]
async fn metrics_returns_prometheus_text() {
    let state = test_state();
    let app = build_admin_router(state);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    // Just needs to be valid text; exact content depends on which metrics
    // families have recorded samples yet.
    String::from_utf8(bytes.to_vec()).unwrap();
}

#[tokio::test]
async fn validate_does_not_touch_snapshot_store() {
    let state = test_state();
    let before = state.proxy_state.store.peek_current().id;
    let app = build_admin_router(state.clone());

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/validate")
                .body(Body::from(empty_config_yaml()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["outcome"], "validated");
    assert_eq!(state.proxy_state.store.peek_current().id, before);
}

#[tokio::test]
async fn validate_rejects_malformed_body() {
    let state = test_state();
    let app = build_admin_router(state);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/validate")
                .body(Body::from("not: [valid yaml"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn apply_swaps_the_live_snapshot() {
    let state = test_state();
    let app = build_admin_router(state.clone());

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/apply")
                .body(Body::from(empty_config_yaml()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["outcome"], "applied");
    assert!(state.current_config.lock().unwrap().is_some());
}

#[tokio::test]
async fn rollback_without_prior_apply_conflicts() {
    let state = test_state();
    let app = build_admin_router(state);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/rollback")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn rollback_after_two_applies_restores_previous_config() {
    let state = test_state();
    let app = build_admin_router(state.clone());

    for _ in 0..2 {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/apply")
                    .body(Body::from(empty_config_yaml()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    assert!(state.previous_config.lock().unwrap().is_some());

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/rollback")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["outcome"], "rolled_back");
}
