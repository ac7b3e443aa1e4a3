//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use fista_search::connectors::BackendStatus;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub active_conversations: usize,
    pub backends: Vec<BackendStatus>,
}

/// Liveness probe - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: fista_common::VERSION.to_string(),
    })
}

/// Readiness probe - ready while at least one backend is enabled
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let backends = state.pool.status().await;
    let ready = backends.iter().any(|b| b.enabled);

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            status: if ready { "ready" } else { "not_ready" }.to_string(),
            active_conversations: state.store.len(),
            backends,
        }),
    )
}
