//! Sync status and registry statistics
//!
//! - `GET /status` - scheduler state and the last run report
//! - `GET /registry/stats` - per-device registry entry counts
//! - `GET /registry/:device` - registry entries of one device
//! - `GET /photos/stats` - photo cache size

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use crate::error::{ApiError, ApiResult};
use crate::scheduler::SchedulerStatus;
use crate::services::image_cache::CacheStats;
use crate::services::registry::{RegistryEntry, RegistryStats};
use crate::AppState;

/// GET /status
pub async fn sync_status(State(state): State<AppState>) -> ApiResult<Json<SchedulerStatus>> {
    let scheduler = state
        .scheduler
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("scheduler not running in this process".to_string()))?;
    Ok(Json(scheduler.status().await))
}

/// GET /registry/stats
pub async fn registry_stats(State(state): State<AppState>) -> ApiResult<Json<RegistryStats>> {
    Ok(Json(state.registry.stats().await?))
}

/// GET /registry/:device
pub async fn device_entries(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> ApiResult<Json<Vec<RegistryEntry>>> {
    let entries = state.registry.list_all(&device).await?;
    if entries.is_empty() {
        return Err(ApiError::NotFound(format!("no registry entries for {}", device)));
    }
    Ok(Json(entries))
}

/// GET /photos/stats
pub async fn photo_stats(State(state): State<AppState>) -> ApiResult<Json<CacheStats>> {
    let cache = state
        .photo_cache
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("no photo cache in this process".to_string()))?;
    Ok(Json(cache.stats().await?))
}

pub fn status_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(sync_status))
        .route("/registry/stats", get(registry_stats))
        .route("/registry/:device", get(device_entries))
        .route("/photos/stats", get(photo_stats))
}
