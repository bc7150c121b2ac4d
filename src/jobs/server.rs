use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use super::api::{self, AppState};
use super::code_source;
use super::events;
use super::service::JobService;
use crate::config::AppConfig;

/// Listener settings for the HTTP server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allow any origin. Only for local front-end development.
    pub permissive_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            permissive_cors: false,
        }
    }
}

impl From<&AppConfig> for ServerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            permissive_cors: false,
        }
    }
}

/// Build the full application router: REST API plus the event stream.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(events::ws_handler))
        .with_state(state)
}

/// Open the store, recover jobs interrupted by a previous process, and wire
/// the shared state.
pub async fn build_state(config: &AppConfig) -> Result<Arc<AppState>> {
    let service = Arc::new(JobService::from_config(config)?);
    let recovered = service
        .recover_interrupted()
        .await
        .context("Failed to recover interrupted jobs")?;
    if !recovered.is_empty() {
        warn!(count = recovered.len(), "recovered interrupted jobs");
    }

    Ok(Arc::new(AppState {
        service,
        code_source: Arc::new(code_source::from_config(&config.code_source)),
    }))
}

/// Start the HTTP server and run until Ctrl+C or SIGTERM.
pub async fn start_server(config: &AppConfig, server: ServerConfig) -> Result<()> {
    let state = build_state(config).await?;
    let service = Arc::clone(&state.service);

    let mut app = build_router(state);
    if server.permissive_cors {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        cli = %config.executor.cli_path.display(),
        workspace_root = %config.executor.workspace_root.display(),
        mode = %config.executor.mode,
        max_workers = config.executor.max_workers,
        "job runner listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    service.shutdown().await;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
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
    info!("shutdown signal received");
}
