//! Common error types for FaceSync

use thiserror::Error;

/// Common result type for FaceSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by FaceSync crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error for persisted state
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input or parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
