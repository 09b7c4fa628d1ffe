//! Thyme scheduler daemon
//!
//! Boots a Qdrant-backed scheduler manager, optionally starts the polling
//! loop, and serves health and metrics endpoints until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use thyme_core::handler::HandlerRegistry;
use thyme_core::manager::{SchedulerManager, SchedulerMetrics};
use thyme_core::SchedulerConfig;
use thyme_store::{QdrantBackend, QdrantBackendConfig};

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics(State(manager): State<Arc<SchedulerManager>>) -> Json<Option<SchedulerMetrics>> {
    match manager.get_metrics().await {
        Ok(metrics) => Json(Some(metrics)),
        Err(e) => {
            error!("metrics query failed: {}", e);
            Json(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "thyme=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Thyme starting up...");

    // Load configuration
    dotenvy::dotenv().ok();
    let config = SchedulerConfig::from_env()?;
    let qdrant_url =
        std::env::var("QDRANT_URL").unwrap_or_else(|_| "http://localhost:6334".to_string());
    let qdrant_api_key = std::env::var("QDRANT_API_KEY").ok();
    let http_port: u16 = std::env::var("HTTP_PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .context("HTTP_PORT must be a valid port number")?;

    info!("Configuration loaded");
    info!("  Qdrant: {}", qdrant_url);
    info!("  Collection: {}", config.collection_name);
    info!("  Tick interval: {}ms", config.scheduling_interval_ms);

    // Connect storage and bring up the manager
    let backend = Arc::new(QdrantBackend::connect(QdrantBackendConfig {
        url: qdrant_url,
        api_key: qdrant_api_key,
    })?);

    let handlers = Arc::new(HandlerRegistry::new());
    let manager = Arc::new(SchedulerManager::with_backend(config, backend, handlers));
    manager.initialize().await?;

    if !manager.is_scheduler_running() {
        manager.start_scheduler().await?;
    }

    // Health and metrics endpoints
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(manager.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", http_port))
        .await
        .context("Failed to bind HTTP listener")?;
    info!("HTTP server listening on port {}", http_port);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("HTTP server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
        }
    }

    manager.stop_scheduler().await?;
    info!("Thyme stopped");
    Ok(())
}
