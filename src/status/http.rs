//! Local status endpoint
//!
//! Read-only: `GET /status` returns the snapshot, `GET /healthz` a liveness
//! check.

use super::reporter::{StatusReporter, StatusSnapshot};
use crate::error::Result;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub fn status_router(reporter: StatusReporter) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(reporter)
}

async fn status(State(reporter): State<StatusReporter>) -> Json<StatusSnapshot> {
    Json(reporter.snapshot().await)
}

async fn healthz(State(reporter): State<StatusReporter>) -> Json<serde_json::Value> {
    let snapshot = reporter.snapshot().await;
    Json(serde_json::json!({
        "status": "ok",
        "phase": snapshot.connection.phase,
        "processes": snapshot.processes.len(),
        "failed_processes": snapshot.failed_processes().count(),
    }))
}

/// Serve the status endpoint until `cancel` fires.
pub async fn serve(addr: SocketAddr, reporter: StatusReporter, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Status endpoint listening on http://{}", listener.local_addr()?);
    axum::serve(listener, status_router(reporter))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
