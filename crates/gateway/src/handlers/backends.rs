//! Backend administration handlers

use axum::{
    extract::{Path, State},
    Json,
};
use fista_common::errors::Result;
use fista_search::connectors::BackendStatus;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct BackendListResponse {
    pub backends: Vec<BackendStatus>,
}

pub async fn list_backends(State(state): State<AppState>) -> Json<BackendListResponse> {
    Json(BackendListResponse {
        backends: state.pool.status().await,
    })
}

/// Enable a backend for queries dispatched from now on
pub async fn enable_backend(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<BackendListResponse>> {
    state.pool.enable(&name).await?;
    Ok(list_backends(State(state)).await)
}

/// Disable a backend; queries already dispatched keep their binding
pub async fn disable_backend(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<BackendListResponse>> {
    state.pool.disable(&name).await?;
    Ok(list_backends(State(state)).await)
}
