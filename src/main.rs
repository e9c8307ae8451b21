mod api;
mod config;
mod db;
mod docker;
mod error;
mod gpu;
mod manager;
mod ports;
mod puller;
mod reconcile;

use std::sync::Arc;

use anyhow::{bail, Result};
use axum::http::{HeaderValue, Method};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::db::store::Store;
use crate::db::Database;
use crate::docker::DockerManager;
use crate::gpu::GpuInventory;
use crate::manager::{InstanceManager, SystemKeySource};
use crate::ports::PortAllocator;
use crate::puller::ModelPuller;
use crate::reconcile::Reconciler;

/// Shared application state available to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub store: Store,
    pub manager: InstanceManager,
    pub puller: ModelPuller,
    pub gpus: GpuInventory,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    // Initialize tracing; LOG_LEVEL seeds the filter unless RUST_LOG is set.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
                tracing_subscriber::EnvFilter::new(format!(
                    "inference_manager={level},tower_http=info"
                ))
            }),
        )
        .init();

    info!("Starting inference-manager v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env()?;
    info!(
        port = config.port,
        min_port = config.min_port,
        max_port = config.max_port,
        "Configuration loaded"
    );

    // Store setup failures exit non-zero.
    let db = Database::connect(&config.db_path).await?;
    db.migrate().await?;
    let store = Store::new(&db);
    info!("Database initialized");

    // The range is fixed for the life of the process and must not shrink
    // below what is already reserved.
    let out_of_range: Vec<i64> = store
        .list_reservations()
        .await?
        .iter()
        .map(|r| r.port)
        .filter(|p| !(config.min_port as i64..=config.max_port as i64).contains(p))
        .collect();
    if !out_of_range.is_empty() {
        bail!(
            "port range [{}-{}] excludes existing reservations {:?}; adjust MIN_PORT/MAX_PORT",
            config.min_port,
            config.max_port,
            out_of_range
        );
    }

    let docker = DockerManager::new(&config).await?;
    info!("Docker manager initialized");

    let gpus = GpuInventory::new();
    gpus.refresh().await;

    let ports = PortAllocator::new(store.clone(), config.port_range());
    let reconciler = Reconciler::new(store.clone(), docker.clone());
    let manager = InstanceManager::new(
        config.clone(),
        store.clone(),
        docker,
        gpus.clone(),
        ports,
        reconciler,
        Arc::new(SystemKeySource),
    );
    let puller = ModelPuller::new(store.clone(), config.default_hostname.clone());

    // Import containers left behind by earlier runs before serving traffic.
    match manager.reconcile(true).await {
        Ok(report) => {
            if !report.imported.is_empty() || !report.stale_ports_dropped.is_empty() {
                info!(
                    imported = report.imported.len(),
                    skipped = report.skipped.len(),
                    stale_ports = report.stale_ports_dropped.len(),
                    "Startup reconciliation complete"
                );
            }
        }
        Err(e) => warn!(error = %e, "Startup reconciliation failed"),
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        manager,
        puller,
        gpus,
    });
    let app = build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config);
    Router::new()
        .nest("/api", api::routes(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Lock CORS to the configured frontend origin in production; stay
/// permissive for local development when none is configured.
fn build_cors_layer(config: &AppConfig) -> CorsLayer {
    match &config.frontend_url {
        Some(origin) => {
            let origin = origin
                .parse::<HeaderValue>()
                .unwrap_or_else(|_| HeaderValue::from_static("http://localhost:3000"));
            CorsLayer::new()
                .allow_origin(AllowOrigin::exact(origin))
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    axum::http::header::CONTENT_TYPE,
                    axum::http::header::AUTHORIZATION,
                    axum::http::header::ACCEPT,
                ])
        }
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    }
}

/// Resolve on SIGTERM or SIGINT; axum then stops accepting and drains
/// in-flight handlers.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received — draining in-flight requests");
}
