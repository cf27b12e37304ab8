//! Crash-safe file helpers
//!
//! All persisted state (registry partitions, photo metadata, the run lock) goes
//! through these helpers. Writes land in a temp file in the target directory and
//! are renamed over the destination, so a crash mid-write leaves either the old
//! or the new content on disk, never a torn file.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Write `data` to `target` atomically (temp file in same directory + rename)
pub fn atomic_write(target: &Path, data: &[u8]) -> Result<()> {
    let parent = target.parent().ok_or_else(|| {
        Error::InvalidInput(format!("path has no parent: {}", target.display()))
    })?;
    std::fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|e| Error::Io(e.error))?;

    tracing::trace!(path = %target.display(), bytes = data.len(), "Atomic write complete");
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn write_json_atomic<T: Serialize + ?Sized>(target: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(target, &bytes)
}

/// Read a JSON file, returning `Ok(None)` when the file does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Reduce an arbitrary key (device address, URL host) to a safe file stem
///
/// Keeps `[A-Za-z0-9._-]`, replaces everything else with `_`.
pub fn sanitize_file_stem(key: &str) -> String {
    let stem: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if stem.is_empty() || stem.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        stem
    }
}
