// =============================================================================
// Status Endpoints — Axum 0.7
// =============================================================================
//
// Read-only surface for operators and the external dashboard: `/health` for
// liveness probes and `/metrics` for the full counter snapshot. CORS is
// permissive; there is nothing mutable behind these routes.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::metrics::Metrics;

/// Build the status router.
pub fn router(metrics: Arc<Metrics>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_snapshot))
        .layer(cors)
        .with_state(metrics)
}

/// Serve the status endpoints until shutdown is signalled.
pub async fn serve(
    metrics: Arc<Metrics>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = router(metrics);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind status server on port {port}"))?;

    info!(port, "status server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("status server failed")?;

    Ok(())
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    all_shards_connected: bool,
    server_time: i64,
}

async fn health(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    let all_connected = metrics.all_shards_connected();
    Json(HealthResponse {
        status: if all_connected { "ok" } else { "degraded" },
        all_shards_connected: all_connected,
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn metrics_snapshot(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    Json(metrics.snapshot())
}
