//! Utility modules for facesync-ds

pub mod retry;

pub use retry::{RetryPolicy, Retryable};
