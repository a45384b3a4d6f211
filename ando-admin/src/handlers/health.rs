use crate::server::AdminState;
use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};
use std::sync::Arc;

/// Liveness/readiness probe. Reports the currently-served snapshot's
/// version and whether the store is under apply-pressure, so an operator
/// can tell "up" from "up but refusing applies" at a glance.
pub async fn healthz(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let current = state.proxy_state.store.peek_current();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "snapshot_version": current.id,
        "snapshot_source": current.source,
        "retired_snapshots": state.proxy_state.store.retired_count(),
        "under_pressure": state.proxy_state.store.pressure(),
    }))
}
