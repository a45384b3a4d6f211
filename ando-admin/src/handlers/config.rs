use crate::server::AdminState;
use ando_store::{ApplyMode, ApplyOutcome};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `POST /validate` — parses and compiles the posted YAML config without
/// ever touching the live snapshot store. A 200 here is a promise that the
/// identical body would also succeed against `/apply`.
pub async fn validate(State(state): State<Arc<AdminState>>, body: Bytes) -> impl IntoResponse {
    apply_or_validate(state, body, ApplyMode::Validate).await
}

/// `POST /apply` — parses, compiles, and swaps the posted YAML config into
/// the live snapshot store. On success the previously-active config is
/// stashed for a later `/rollback`.
pub async fn apply(State(state): State<Arc<AdminState>>, body: Bytes) -> impl IntoResponse {
    apply_or_validate(state, body, ApplyMode::Apply).await
}

async fn apply_or_validate(
    state: Arc<AdminState>,
    body: Bytes,
    mode: ApplyMode,
) -> axum::response::Response {
    let cfg = match ando_store::ConfigSource::parse_bytes(&body) {
        Ok(cfg) => cfg,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "config_parse_failed", "message": err.to_string() })),
            )
                .into_response()
        }
    };

    let outcome = state.config_source.apply(
        mode,
        &cfg,
        &state.proxy_state.registries,
        &state.proxy_state.store,
        "admin",
        epoch_millis(),
        chrono::Utc::now(),
    );

    match outcome {
        Ok(ApplyOutcome::Validated) => {
            state.proxy_state.metrics.config_apply_total.with_label_values(&["validated"]).inc();
            (StatusCode::OK, Json(json!({ "outcome": "validated" }))).into_response()
        }
        Ok(ApplyOutcome::Applied { snapshot_id }) => {
            state.proxy_state.metrics.config_apply_total.with_label_values(&["applied"]).inc();
            let mut previous = state.previous_config.lock().unwrap();
            if let Some(current) = state.current_config.lock().unwrap().replace(cfg) {
                *previous = Some(current);
            }
            (
                StatusCode::OK,
                Json(json!({ "outcome": "applied", "snapshot_id": snapshot_id })),
            )
                .into_response()
        }
        Err(err) => {
            state.proxy_state.metrics.config_apply_total.with_label_values(&["rejected"]).inc();
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": "config_rejected", "message": err.to_string() })),
            )
                .into_response()
        }
    }
}

/// `POST /rollback` — re-applies the config that was active immediately
/// before the last successful `/apply`. One level deep only: rolling back
/// twice in a row re-applies the same prior config rather than walking
/// further back, since the admin surface here is a minimal stand-in (the
/// real bundle/version history lives in the out-of-scope config-bundle
/// distributor named in spec §1).
pub async fn rollback(State(state): State<Arc<AdminState>>) -> axum::response::Response {
    let previous = state.previous_config.lock().unwrap().clone();
    let Some(cfg) = previous else {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "no_previous_config", "message": "nothing to roll back to" })),
        )
            .into_response();
    };

    let outcome = state.config_source.apply(
        ApplyMode::Apply,
        &cfg,
        &state.proxy_state.registries,
        &state.proxy_state.store,
        "admin-rollback",
        epoch_millis(),
        chrono::Utc::now(),
    );

    match outcome {
        Ok(ApplyOutcome::Applied { snapshot_id }) => {
            state.proxy_state.metrics.rollback_total.inc();
            *state.current_config.lock().unwrap() = Some(cfg);
            (
                StatusCode::OK,
                Json(json!({ "outcome": "rolled_back", "snapshot_id": snapshot_id })),
            )
                .into_response()
        }
        Ok(ApplyOutcome::Validated) => unreachable!("rollback always applies"),
        Err(err) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "rollback_rejected", "message": err.to_string() })),
        )
            .into_response(),
    }
}
