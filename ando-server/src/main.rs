// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Ando CE — reconfigurable HTTP reverse proxy
//
//  Data plane:  axum on the main tokio runtime
//  Admin API:   axum on a dedicated tokio task, same process
//  Config:      YAML file + `ANDO_`-prefixed env, reapplied via /apply
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use ando_admin::{AdminServer, AdminState};
use ando_plugin::HttpJsonTransport;
use ando_proxy::ProxyState;
use ando_resilience::Registries;
use ando_store::ConfigSource;
use axum::routing::any;
use axum::Router as AxumRouter;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ando", version, about = "Ando CE — reconfigurable HTTP reverse proxy")]
struct Cli {
    /// Path to the YAML config file. Missing is fine — figment falls back
    /// to `ANDO_`-prefixed env vars and the compiled-in defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.as_ref().map(|p| p.display().to_string());
    let config_source = Arc::new(ConfigSource::new(config_path));
    let cfg = config_source.load()?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.logging.level.clone()));
    if cfg.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), node_id = %cfg.node_id, "ando starting");

    // ── Registries + initial snapshot ──
    let registries = Registries::new();
    let store = {
        let snapshot = ando_proxy::builder::SnapshotBuilder::build(
            &cfg,
            &registries,
            "boot",
            0,
            epoch_millis(),
            chrono::Utc::now(),
        )?;
        ando_core::store::SnapshotStore::new(Arc::new(snapshot))
    };

    let transport: Arc<dyn ando_plugin::PluginTransport> = Arc::new(HttpJsonTransport::default());
    let proxy_state = Arc::new(ProxyState::new(store, registries, transport)?);

    // ── Registry maintenance tick ──
    let tick_state = proxy_state.clone();
    let tick_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            tick_state.registries.tick(30_000, 30_000, epoch_millis());
            tick_state.store.reap();
        }
    });

    // ── Admin API ──
    let admin_state = Arc::new(AdminState::new(proxy_state.clone(), config_source.clone()));
    *admin_state.current_config.lock().unwrap() = Some(cfg.clone());
    let admin_addr = cfg.admin.addr;
    let admin_enabled = cfg.admin.enabled;
    let admin_handle = if admin_enabled {
        let server = AdminServer::new(cfg.admin.clone(), admin_state);
        Some(tokio::spawn(async move {
            if let Err(err) = server.start().await {
                tracing::error!(error = %err, "admin API failed");
            }
        }))
    } else {
        info!("admin API disabled");
        None
    };

    // ── Data plane ──
    let proxy_addr: SocketAddr = cfg.proxy.http_addr;
    let app = AxumRouter::new()
        .fallback(any(ando_proxy::handle))
        .with_state(proxy_state.clone());

    let listener = tokio::net::TcpListener::bind(proxy_addr).await?;
    info!(addr = %proxy_addr, admin_addr = %admin_addr, "ando is ready — serving traffic");

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = serve.await {
        tracing::error!(error = %err, "data plane server error");
    }

    // ── Graceful shutdown sequence ──
    info!("draining: waiting for load balancers to converge");
    tokio::time::sleep(Duration::from_millis(cfg.proxy.drain_ms)).await;

    info!("draining: waiting for inflight requests to reach zero");
    let deadline = tokio::time::Instant::now() + Duration::from_millis(cfg.proxy.graceful_timeout_ms);
    while proxy_state.inflight.load(Ordering::Acquire) > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if proxy_state.inflight.load(Ordering::Acquire) > 0 {
        warn!(
            inflight = proxy_state.inflight.load(Ordering::Acquire),
            "graceful timeout elapsed with requests still inflight, force-closing"
        );
        tokio::time::sleep(Duration::from_millis(cfg.proxy.force_close_ms)).await;
    }

    // Leaves-first: transports and pool endpoints hold no references into
    // the other registries, traffic plans reference pool keys, so stop the
    // maintenance tick (the only background activity registries have)
    // before anything else is torn down.
    tick_handle.abort();
    if let Some(handle) = admin_handle {
        handle.abort();
    }

    info!("ando stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = ctrl_c => {}
    }
    info!("shutdown signal received, draining");
}
