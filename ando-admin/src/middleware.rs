use crate::server::AdminState;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

/// Admin API key authentication. A no-op today — the spec's admin surface
/// is out of scope beyond its interface shape (§1) and names no auth
/// mechanism, so this is a placeholder seam for whatever the deployment
/// wraps the admin listener with (mTLS, a reverse-proxy auth layer, etc).
pub async fn api_key_auth(
    State(state): State<Arc<AdminState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let _ = state;
    Ok(next.run(request).await)
}
