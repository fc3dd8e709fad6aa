//! Read-only status API using Axum (exposed on port 11111 by default)
//!
//! - `GET /health`: liveness plus the last metrics snapshot.
//! - `GET /guilds`: every registered guild with its last reconcile outcome.
//! - `GET /guilds/:guild_id`: one guild, 404 when it is not registered.
//!
//! Answers come from the guild registry and the status board only.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

use crate::status::{GuildStatus, MetricsSnapshot, StatusBoard};
use crate::storage::Storage;

/// Shared app state for REST handlers (Arc-wrapped for concurrency)
#[derive(Clone)]
pub struct AppState {
    store: Storage,
    status: StatusBoard,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub success: bool,
    pub message: String,
    pub registered_guilds: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_metrics: Option<MetricsSnapshot>,
}

#[derive(Serialize)]
pub struct GuildEntry {
    pub guild_id: String,
    /// `None` until the first reconcile of this guild has finished.
    pub status: Option<GuildStatus>,
}

pub fn create_router(store: Storage, status: StatusBoard) -> Router {
    let state = Arc::new(AppState { store, status });

    Router::new()
        .route("/health", get(health_handler))
        .route("/guilds", get(list_guilds_handler))
        .route("/guilds/:guild_id", get(get_guild_handler))
        .with_state(state)
}

fn registry(state: &AppState) -> Result<Vec<String>, StatusCode> {
    state.store.registered_guilds().map_err(|err| {
        error!(error = %err, "failed to read guild registry");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, StatusCode> {
    let registered_guilds = registry(&state)?.len();
    Ok(Json(HealthResponse {
        success: true,
        message: "stat_channels healthy".to_string(),
        registered_guilds,
        last_metrics: state.status.last_metrics().await,
    }))
}

async fn list_guilds_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<GuildEntry>>, StatusCode> {
    let mut entries = Vec::new();
    for guild_id in registry(&state)? {
        let status = state.status.guild(&guild_id).await;
        entries.push(GuildEntry { guild_id, status });
    }
    Ok(Json(entries))
}

async fn get_guild_handler(
    State(state): State<Arc<AppState>>,
    Path(guild_id): Path<String>,
) -> Result<Json<GuildEntry>, StatusCode> {
    let registered = state.store.is_registered(&guild_id).map_err(|err| {
        error!(guild_id = %guild_id, error = %err, "failed to read guild registry");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if !registered {
        return Err(StatusCode::NOT_FOUND);
    }
    let status = state.status.guild(&guild_id).await;
    Ok(Json(GuildEntry { guild_id, status }))
}
