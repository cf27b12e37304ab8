//! Timestamp utilities

use chrono::{DateTime, Utc};

/// Timestamp suitable for file names; lexicographic order equals chronological order
pub fn file_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%.9fZ").to_string()
}

/// Age of `since` relative to `now`, clamped at zero for clock skew
pub fn age(since: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or(std::time::Duration::ZERO)
}
