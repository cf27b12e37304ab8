//! Data models for facesync-ds

pub mod identity;
pub mod report;

pub use identity::{merge_roster, Contact, Identity, IdentityKind, PreparedIdentity, RosterEntry};
pub use report::{
    BatchOutcome, DeviceResult, DeviceStats, ProcessingFailure, ReportTotals, SyncReport,
};
