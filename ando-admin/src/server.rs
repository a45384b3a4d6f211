use crate::handlers;
use ando_core::config::AdminConfig;
use ando_proxy::ProxyState;
use ando_store::ConfigSource;
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Shared state for the admin surface: a handle into the same `ProxyState`
/// the data plane serves from (so `/apply` reconciles the registries the
/// request path actually reads), plus the one-level rollback history.
pub struct AdminState {
    pub proxy_state: Arc<ProxyState>,
    pub config_source: Arc<ConfigSource>,
    pub current_config: Mutex<Option<ando_core::config::AndoConfig>>,
    pub previous_config: Mutex<Option<ando_core::config::AndoConfig>>,
}

impl AdminState {
    pub fn new(proxy_state: Arc<ProxyState>, config_source: Arc<ConfigSource>) -> Self {
        Self {
            proxy_state,
            config_source,
            current_config: Mutex::new(None),
            previous_config: Mutex::new(None),
        }
    }
}

/// Admin REST API server: `/validate`, `/apply`, `/rollback`, `/healthz`,
/// `/metrics` — kept deliberately minimal per spec §1, which scopes the
/// admin HTTP surface, the signed-bundle distributor, and TLS listener
/// wiring out as external collaborators specified only by interface.
pub struct AdminServer {
    config: AdminConfig,
    state: Arc<AdminState>,
}

impl AdminServer {
    pub fn new(config: AdminConfig, state: Arc<AdminState>) -> Self {
        Self { config, state }
    }

    pub async fn start(self) -> anyhow::Result<()> {
        if !self.config.enabled {
            info!("admin API disabled");
            return Ok(());
        }

        let addr = self.config.addr;
        let app = build_admin_router(self.state);

        info!(addr = %addr, "starting admin API server");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

pub fn build_admin_router(state: Arc<AdminState>) -> AxumRouter {
    AxumRouter::new()
        .route("/validate", post(handlers::config::validate))
        .route("/apply", post(handlers::config::apply))
        .route("/rollback", post(handlers::config::rollback))
        .route("/healthz", get(handlers::health::healthz))
        .route("/metrics", get(handlers::metrics::metrics))
        .with_state(state)
}
