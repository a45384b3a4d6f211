use crate::server::AdminState;
use axum::extract::State;
use std::sync::Arc;

/// Prometheus text exposition, scraped by whatever collector spec §6's
/// "metrics/log exporters" collaborator wires up — out of scope here.
pub async fn metrics(State(state): State<Arc<AdminState>>) -> String {
    state.proxy_state.metrics.gather_text()
}
