//! Run statistics and the structured report produced by every sync cycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-device reconciliation counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Identities already enrolled with matching registry state (left alone)
    pub verified: usize,
    /// Device records deleted before re-enrollment or as stale
    pub users_deleted: usize,
    pub delete_failures: usize,
    /// Identities accepted by the device in identity chunks
    pub users_registered: usize,
    pub identity_chunk_failures: usize,
    /// Faces accepted by the device in face chunks
    pub faces_registered: usize,
    pub face_chunk_failures: usize,
    /// Identity ids created but not seen on the device afterwards
    pub unconfirmed: Vec<String>,
    /// Registry entries removed because their invite left the roster
    pub users_pruned: usize,
    /// Departed invites kept because their device records could not be removed
    #[serde(default)]
    pub prune_deferred: usize,
    /// Registry entries written in the cache commit
    pub cache_saves: usize,
    /// Non-fatal error messages, in occurrence order
    pub errors: Vec<String>,
}

impl DeviceStats {
    /// No chunk, delete or listing errors and every created identity confirmed
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.unconfirmed.is_empty()
    }

    pub fn problem_summary(&self) -> String {
        format!(
            "{} errors, {} unconfirmed",
            self.errors.len(),
            self.unconfirmed.len()
        )
    }

    pub fn display_string(&self) -> String {
        format!(
            "{} verified, {} deleted, {} registered, {} faces, {} unconfirmed, {} cache saves",
            self.verified,
            self.users_deleted,
            self.users_registered,
            self.faces_registered,
            self.unconfirmed.len(),
            self.cache_saves
        )
    }
}

/// Outcome of one device's unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceResult {
    pub device: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stats: DeviceStats,
    pub duration_ms: u64,
}

/// Result of fanning one batch out to all devices
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub results: Vec<DeviceResult>,
}

impl BatchOutcome {
    pub fn devices_succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn devices_failed(&self) -> usize {
        self.results.len() - self.devices_succeeded()
    }

    /// True only when every device reconciled successfully
    pub fn success(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}

/// Identity dropped before reaching any device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingFailure {
    pub identity_id: String,
    pub invite_id: String,
    pub reason: String,
}

/// Totals across all devices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTotals {
    pub verified: usize,
    pub deleted: usize,
    pub registered: usize,
    pub faces_registered: usize,
    pub cache_saves: usize,
    pub unconfirmed: usize,
    pub processing_errors: usize,
}

/// Structured report of one sync cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Identities in the merged roster
    pub roster_size: usize,
    /// Identities with a ready payload
    pub prepared: usize,
    pub processing_failures: Vec<ProcessingFailure>,
    pub totals: ReportTotals,
    pub devices_succeeded: usize,
    pub devices_failed: usize,
    pub devices: Vec<DeviceResult>,
    /// Every device succeeded and no identity was dropped during preparation
    pub success: bool,
}

impl SyncReport {
    pub fn assemble(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        roster_size: usize,
        prepared: usize,
        processing_failures: Vec<ProcessingFailure>,
        outcome: BatchOutcome,
    ) -> Self {
        let mut totals = ReportTotals {
            processing_errors: processing_failures.len(),
            ..Default::default()
        };
        for result in &outcome.results {
            totals.verified += result.stats.verified;
            totals.deleted += result.stats.users_deleted;
            totals.registered += result.stats.users_registered;
            totals.faces_registered += result.stats.faces_registered;
            totals.cache_saves += result.stats.cache_saves;
            totals.unconfirmed += result.stats.unconfirmed.len();
        }

        let devices_succeeded = outcome.devices_succeeded();
        let devices_failed = outcome.devices_failed();
        let success = outcome.success() && processing_failures.is_empty();

        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            roster_size,
            prepared,
            processing_failures,
            totals,
            devices_succeeded,
            devices_failed,
            devices: outcome.results,
            success,
        }
    }

    pub fn display_string(&self) -> String {
        format!(
            "{} identities ({} prepared, {} processing errors); {} verified, {} deleted, {} registered, {} faces, {} cache saves; devices {} ok / {} failed",
            self.roster_size,
            self.prepared,
            self.totals.processing_errors,
            self.totals.verified,
            self.totals.deleted,
            self.totals.registered,
            self.totals.faces_registered,
            self.totals.cache_saves,
            self.devices_succeeded,
            self.devices_failed
        )
    }
}
