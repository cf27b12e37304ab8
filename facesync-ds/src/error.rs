//! Error types for facesync-ds
//!
//! Layered the way failures propagate through a sync cycle:
//! - `DeviceError` / `PhotoError` / `MirrorError` live next to the component that raises them
//! - `SyncError` is the device- and cycle-level error folded into run reports
//! - `ApiError` is the status endpoint's HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::device_client::DeviceError;
use crate::services::image_cache::PhotoError;

/// Device- and cycle-level failure
#[derive(Debug, Error)]
pub enum SyncError {
    /// Device could not be driven at all (auth misconfiguration, client construction)
    #[error("Device {device}: {source}")]
    Device {
        device: String,
        #[source]
        source: DeviceError,
    },

    /// Device reconciliation exceeded its time budget
    #[error("Device {device} timed out after {seconds}s")]
    DeviceTimeout { device: String, seconds: u64 },

    /// Device worker task panicked or was cancelled
    #[error("Device {device} worker failed: {reason}")]
    DeviceWorker { device: String, reason: String },

    /// Photo cache could not be opened
    #[error("Photo error: {0}")]
    Photo(#[from] PhotoError),

    /// Upstream roster could not be fetched
    #[error("Roster error: {0}")]
    Roster(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted state error (registry, lock file)
    #[error("Storage error: {0}")]
    Storage(#[from] facesync_common::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn device(device: impl Into<String>, source: DeviceError) -> Self {
        SyncError::Device {
            device: device.into(),
            source,
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(facesync_common::Error::Io(err))
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// API error type for the status endpoints
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Photo cache unreadable (500)
    #[error(transparent)]
    Photo(#[from] PhotoError),

    /// Sync error surfaced through the API
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Photo(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "PHOTO_CACHE_ERROR",
                err.to_string(),
            ),
            ApiError::Sync(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SYNC_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
