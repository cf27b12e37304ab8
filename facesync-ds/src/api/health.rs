//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" after a failed cycle
    pub status: String,
    pub module: String,
    pub version: String,
    /// Short git hash captured at build time
    pub build: String,
    pub build_timestamp: String,
    /// `debug` or `release`
    pub build_profile: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let last_error = match &state.scheduler {
        Some(scheduler) => scheduler.status().await.last_error,
        None => None,
    };

    Json(HealthResponse {
        status: if last_error.is_some() { "degraded" } else { "ok" }.to_string(),
        module: "facesync-ds".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        build: env!("GIT_HASH").to_string(),
        build_timestamp: env!("BUILD_TIMESTAMP").to_string(),
        build_profile: env!("BUILD_PROFILE").to_string(),
        uptime_seconds,
        last_error,
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
