//! # FaceSync Common Library
//!
//! Shared code for FaceSync crates:
//! - Error types
//! - Configuration file discovery and root folder layout
//! - Crash-safe JSON persistence helpers
//! - Content hashing and timestamp utilities

pub mod config;
pub mod error;
pub mod fs;
pub mod hash;
pub mod time;

pub use error::{Error, Result};
