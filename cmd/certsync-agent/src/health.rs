//! Health and status endpoints for certsync-agent
//!
//! - /healthz - Liveness check
//! - /status - Last cycle outcome and renewal as JSON

use crate::orchestrator::AgentStatus;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Shared state for health endpoints
pub struct HealthState {
    pub status: Arc<RwLock<AgentStatus>>,
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let status = state.status.read().await.clone();
    (StatusCode::OK, Json(status))
}

/// Router serving `/healthz` and `/status`
pub fn create_health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(state)
}

/// Bind `addr` and serve the health router until the task is dropped
pub async fn serve(addr: SocketAddr, state: Arc<HealthState>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Starting health HTTP server");
    axum::serve(listener, create_health_router(state)).await
}
