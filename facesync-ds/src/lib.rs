//! facesync-ds library interface
//!
//! Device sync engine for facial-recognition access-control terminals. Exposes
//! the engine's components for the binary and for integration testing.

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult, SyncError, SyncResult};

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::scheduler::Scheduler;
use crate::services::image_cache::ImageCache;
use crate::services::registry::DeviceRegistry;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    /// Absent when the process serves status without scheduling
    pub scheduler: Option<Arc<Scheduler>>,
    /// Photo cache of the scheduled pipeline
    pub photo_cache: Option<Arc<ImageCache>>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(registry: Arc<DeviceRegistry>, scheduler: Option<Arc<Scheduler>>) -> Self {
        Self {
            registry,
            scheduler,
            photo_cache: None,
            startup_time: Utc::now(),
        }
    }

    pub fn with_photo_cache(mut self, photo_cache: Arc<ImageCache>) -> Self {
        self.photo_cache = Some(photo_cache);
        self
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::status_routes())
        .with_state(state)
}
