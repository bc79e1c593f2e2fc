use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::EngineConfig;
use crate::engine::build_registry;
use crate::engine::dispatch::PhaseDispatcher;
use crate::store::{DbHandle, EngineDb};

pub mod api;

pub use api::{AppState, SharedState};

/// Configuration for the engine server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            db_path: std::path::PathBuf::from(".atelier/engine.db"),
            dev_mode: false,
        }
    }
}

pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the engine server. Blocks until Ctrl+C.
pub async fn start_server(config: ServerConfig, engine: EngineConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = EngineDb::new(&config.db_path).context("Failed to initialize engine database")?;
    let registry = Arc::new(build_registry().context("Failed to build handler registry")?);
    info!(handlers = registry.len(), "handler registry built");

    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        dispatcher: PhaseDispatcher::new(registry, engine.fallback_policy),
        engine,
    });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "engine listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to install Ctrl+C handler");
    }
    info!("shutting down");
}
