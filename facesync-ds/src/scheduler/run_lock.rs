//! Filesystem run lock
//!
//! `sync.lock` holds `{ownerPid, startedAt}` while a cycle runs. The file is
//! created with a no-clobber rename, so it is never observed half-written. A lock
//! whose owner process is gone, whose age exceeds `max_age`, or whose content is
//! unreadable is stale and gets reclaimed with a warning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use facesync_common::time::age;

use crate::error::{SyncError, SyncResult};

/// Locks older than this are reclaimed even if the owner is alive
pub const DEFAULT_MAX_LOCK_AGE: Duration = Duration::from_secs(30 * 60);

const ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub owner_pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum LockAttempt {
    Acquired(RunLockGuard),
    /// Held by a live, fresh owner
    Held(LockRecord),
}

enum Existing {
    Live(LockRecord),
    Stale(String),
    Gone,
}

#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
    max_age: Duration,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_age: DEFAULT_MAX_LOCK_AGE,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn try_acquire(&self) -> SyncResult<LockAttempt> {
        for _ in 0..ACQUIRE_ATTEMPTS {
            let record = LockRecord {
                owner_pid: std::process::id(),
                started_at: Utc::now(),
            };
            if self.create(&record)? {
                tracing::debug!(path = %self.path.display(), "Run lock acquired");
                return Ok(LockAttempt::Acquired(RunLockGuard {
                    path: self.path.clone(),
                    record,
                }));
            }

            match self.inspect()? {
                Existing::Live(holder) => return Ok(LockAttempt::Held(holder)),
                Existing::Stale(reason) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        reason = %reason,
                        "Forced release of stale run lock"
                    );
                    match std::fs::remove_file(&self.path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                // Released between our create and read
                Existing::Gone => {}
            }
        }

        Err(SyncError::Internal(format!(
            "could not acquire run lock {} after {} attempts",
            self.path.display(),
            ACQUIRE_ATTEMPTS
        )))
    }

    /// Exclusive create; `false` if a lock file already exists
    fn create(&self, record: &LockRecord) -> SyncResult<bool> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer(&mut temp, record)
            .map_err(|e| SyncError::Internal(format!("encode lock record: {}", e)))?;
        temp.flush()?;
        temp.as_file().sync_all()?;

        match temp.persist_noclobber(&self.path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error.into()),
        }
    }

    fn inspect(&self) -> SyncResult<Existing> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Existing::Gone),
            Err(e) => return Err(e.into()),
        };

        let holder: LockRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => return Ok(Existing::Stale(format!("unreadable lock record: {}", e))),
        };

        if !is_pid_alive(holder.owner_pid) {
            return Ok(Existing::Stale(format!(
                "owner pid {} no longer exists",
                holder.owner_pid
            )));
        }

        let held_for = age(holder.started_at, Utc::now());
        if held_for > self.max_age {
            return Ok(Existing::Stale(format!(
                "held by pid {} for {}s",
                holder.owner_pid,
                held_for.as_secs()
            )));
        }

        Ok(Existing::Live(holder))
    }
}

/// Removes the lock file on drop, if it still holds our record
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    record: LockRecord,
}

impl RunLockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        let ours = std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockRecord>(&bytes).ok())
            .is_some_and(|current| current == self.record);
        if !ours {
            tracing::warn!(path = %self.path.display(), "Run lock was taken over, leaving it in place");
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release run lock");
        } else {
            tracing::debug!(path = %self.path.display(), "Run lock released");
        }
    }
}

fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs the existence and permission check only
        #[allow(unsafe_code)]
        let result = unsafe { libc::kill(pid_i32, 0) };
        if result == 0 {
            return true;
        }
        // EPERM: exists, owned by another user
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        errno == libc::EPERM
    }
    #[cfg(not(unix))]
    {
        let _ = pid_i32;
        true
    }
}
