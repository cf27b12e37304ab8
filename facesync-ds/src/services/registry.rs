//! Device Registry Cache
//!
//! Durable per-device record of what the engine has enrolled, keyed by invite id.
//! Each device is one JSON partition, `registry/<device>.json`. Every mutation
//! first copies the prior partition to `registry/backups/<device>/` (the newest
//! `max_backups` are kept) and then rewrites the partition atomically.
//!
//! Partitions are locked independently. The optional mirror is written after the
//! partition lock is released and its failures are only logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

use facesync_common::fs::{read_json, sanitize_file_stem, write_json_atomic};
use facesync_common::time::file_timestamp;

use crate::error::{SyncError, SyncResult};
use crate::models::Identity;
use crate::services::mirror::{mirror_member, NoopMirror, RegistryMirror};

/// Default number of backups kept per device
pub const DEFAULT_MAX_BACKUPS: usize = 10;

/// One persisted registry row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub invite_id: String,
    pub identity_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Face chunk for this identity was accepted by the device
    #[serde(default)]
    pub face_enrolled: bool,
    pub registered_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl RegistryEntry {
    fn mirror_member(&self) -> String {
        mirror_member(&self.identity_id, &self.invite_id)
    }
}

/// Upsert input; timestamps are managed by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRecord {
    pub identity_id: String,
    pub display_name: String,
    pub document_ref: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub face_enrolled: bool,
}

impl RegistryRecord {
    pub fn from_identity(identity: &Identity, face_enrolled: bool) -> Self {
        Self {
            identity_id: identity.identity_id.clone(),
            display_name: identity.display_name.clone(),
            document_ref: identity.document_ref.clone(),
            email: identity.contact.email.clone(),
            phone: identity.contact.phone.clone(),
            face_enrolled,
        }
    }
}

/// Entry counts across all persisted partitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub devices: usize,
    pub total_entries: usize,
    /// Partition file stem → entry count
    pub per_device: BTreeMap<String, usize>,
}

type Partition = BTreeMap<String, RegistryEntry>;
type PartitionSlot = Arc<Mutex<Option<Partition>>>;

/// Mirror changes produced by one mutation
#[derive(Default)]
struct MirrorDelta {
    added: Vec<String>,
    removed: Vec<String>,
}

/// Handle to the on-disk registry
pub struct DeviceRegistry {
    registry_dir: PathBuf,
    backups_dir: PathBuf,
    max_backups: usize,
    mirror: Arc<dyn RegistryMirror>,
    partitions: StdMutex<HashMap<String, PartitionSlot>>,
}

impl DeviceRegistry {
    pub fn new(registry_dir: impl Into<PathBuf>, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry_dir: registry_dir.into(),
            backups_dir: backups_dir.into(),
            max_backups: DEFAULT_MAX_BACKUPS,
            mirror: Arc::new(NoopMirror),
            partitions: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups.max(1);
        self
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn RegistryMirror>) -> Self {
        self.mirror = mirror;
        self
    }

    fn partition_path(&self, device: &str) -> PathBuf {
        self.registry_dir
            .join(format!("{}.json", sanitize_file_stem(device)))
    }

    fn backup_dir(&self, device: &str) -> PathBuf {
        self.backups_dir.join(sanitize_file_stem(device))
    }

    fn slot(&self, device: &str) -> SyncResult<PartitionSlot> {
        let mut partitions = self
            .partitions
            .lock()
            .map_err(|_| SyncError::Internal("registry partition map poisoned".to_string()))?;
        Ok(partitions
            .entry(sanitize_file_stem(device))
            .or_default()
            .clone())
    }

    /// Load the partition into `cached` on first use
    fn ensure_loaded<'a>(
        &self,
        device: &str,
        cached: &'a mut Option<Partition>,
    ) -> SyncResult<&'a mut Partition> {
        if cached.is_none() {
            let path = self.partition_path(device);
            let partition: Partition = read_json(&path)?.unwrap_or_default();
            tracing::trace!(
                device = %device,
                entries = partition.len(),
                "Loaded registry partition"
            );
            *cached = Some(partition);
        }
        Ok(cached.get_or_insert_with(BTreeMap::new))
    }

    /// Backup the prior partition, then rewrite it atomically
    fn commit(&self, device: &str, partition: &Partition) -> SyncResult<()> {
        let path = self.partition_path(device);
        if path.exists() {
            self.backup(device, &path)?;
        }
        write_json_atomic(&path, partition)?;
        Ok(())
    }

    fn backup(&self, device: &str, current: &Path) -> SyncResult<()> {
        let dir = self.backup_dir(device);
        std::fs::create_dir_all(&dir)?;

        let stem = sanitize_file_stem(device);
        let backup_path = dir.join(format!("{}_{}.json", stem, file_timestamp(Utc::now())));
        std::fs::copy(current, &backup_path)?;

        // Timestamps sort lexically, oldest first
        let mut backups: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        backups.sort();

        let excess = backups.len().saturating_sub(self.max_backups);
        for old in backups.iter().take(excess) {
            if let Err(e) = std::fs::remove_file(old) {
                tracing::warn!(path = %old.display(), error = %e, "Failed to prune registry backup");
            }
        }
        Ok(())
    }

    async fn sync_mirror(&self, device: &str, delta: MirrorDelta) {
        if !delta.removed.is_empty() {
            if let Err(e) = self.mirror.remove(device, &delta.removed).await {
                tracing::warn!(device = %device, error = %e, "Mirror remove failed");
            }
        }
        if !delta.added.is_empty() {
            if let Err(e) = self.mirror.add(device, &delta.added).await {
                tracing::warn!(device = %device, error = %e, "Mirror add failed");
            }
        }
    }

    /// All entries of a device, keyed by invite id
    pub async fn load(&self, device: &str) -> SyncResult<BTreeMap<String, RegistryEntry>> {
        let slot = self.slot(device)?;
        let mut guard = slot.lock().await;
        Ok(self.ensure_loaded(device, &mut guard)?.clone())
    }

    pub async fn list_all(&self, device: &str) -> SyncResult<Vec<RegistryEntry>> {
        Ok(self.load(device).await?.into_values().collect())
    }

    pub async fn contains(&self, device: &str, invite_id: &str) -> SyncResult<bool> {
        let slot = self.slot(device)?;
        let mut guard = slot.lock().await;
        Ok(self.ensure_loaded(device, &mut guard)?.contains_key(invite_id))
    }

    pub async fn upsert(
        &self,
        device: &str,
        invite_id: &str,
        record: RegistryRecord,
    ) -> SyncResult<RegistryEntry> {
        let mut entries = self
            .upsert_many(device, vec![(invite_id.to_string(), record)])
            .await?;
        entries
            .pop()
            .ok_or_else(|| SyncError::Internal("upsert produced no entry".to_string()))
    }

    /// Upsert a batch with a single backup and rewrite
    ///
    /// `registeredAt` survives overwrites; `lastUpdated` is refreshed.
    pub async fn upsert_many(
        &self,
        device: &str,
        records: Vec<(String, RegistryRecord)>,
    ) -> SyncResult<Vec<RegistryEntry>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let slot = self.slot(device)?;
        let mut delta = MirrorDelta::default();
        let written = {
            let mut guard = slot.lock().await;
            let partition = self.ensure_loaded(device, &mut guard)?;
            let mut next = partition.clone();
            let now = Utc::now();
            let mut written = Vec::with_capacity(records.len());

            for (invite_id, record) in records {
                let previous = next.get(&invite_id);
                let registered_at = previous.map(|p| p.registered_at).unwrap_or(now);
                if let Some(prev) = previous {
                    if prev.identity_id != record.identity_id {
                        delta.removed.push(prev.mirror_member());
                    }
                }

                let entry = RegistryEntry {
                    invite_id: invite_id.clone(),
                    identity_id: record.identity_id,
                    display_name: record.display_name,
                    document_ref: record.document_ref,
                    email: record.email,
                    phone: record.phone,
                    face_enrolled: record.face_enrolled,
                    registered_at,
                    last_updated: now,
                };
                delta.added.push(entry.mirror_member());
                next.insert(invite_id, entry.clone());
                written.push(entry);
            }

            self.commit(device, &next)?;
            *partition = next;
            written
        };

        tracing::debug!(device = %device, entries = written.len(), "Registry entries upserted");
        self.sync_mirror(device, delta).await;
        Ok(written)
    }

    /// Remove one entry; returns the removed entry, if any
    pub async fn remove(&self, device: &str, invite_id: &str) -> SyncResult<Option<RegistryEntry>> {
        let mut removed = self.remove_many(device, &[invite_id.to_string()]).await?;
        Ok(removed.pop())
    }

    /// Remove several entries with a single backup and rewrite
    pub async fn remove_many(
        &self,
        device: &str,
        invite_ids: &[String],
    ) -> SyncResult<Vec<RegistryEntry>> {
        let slot = self.slot(device)?;
        let removed = {
            let mut guard = slot.lock().await;
            let partition = self.ensure_loaded(device, &mut guard)?;
            if !invite_ids.iter().any(|id| partition.contains_key(id)) {
                return Ok(Vec::new());
            }

            let mut next = partition.clone();
            let removed: Vec<RegistryEntry> =
                invite_ids.iter().filter_map(|id| next.remove(id)).collect();
            self.commit(device, &next)?;
            *partition = next;
            removed
        };

        let delta = MirrorDelta {
            added: Vec::new(),
            removed: removed.iter().map(RegistryEntry::mirror_member).collect(),
        };
        tracing::debug!(device = %device, entries = removed.len(), "Registry entries removed");
        self.sync_mirror(device, delta).await;
        Ok(removed)
    }

    /// Drop every entry of a device; returns how many were removed
    pub async fn clear(&self, device: &str) -> SyncResult<usize> {
        let slot = self.slot(device)?;
        let count = {
            let mut guard = slot.lock().await;
            let partition = self.ensure_loaded(device, &mut guard)?;
            if partition.is_empty() {
                return Ok(0);
            }
            let count = partition.len();
            let empty = Partition::new();
            self.commit(device, &empty)?;
            *partition = empty;
            count
        };

        if let Err(e) = self.mirror.replace(device, &[]).await {
            tracing::warn!(device = %device, error = %e, "Mirror clear failed");
        }
        tracing::info!(device = %device, entries = count, "Registry partition cleared");
        Ok(count)
    }

    /// Replay a device's primary state into the mirror
    pub async fn rebuild_mirror(&self, device: &str) -> SyncResult<usize> {
        let members: Vec<String> = self
            .list_all(device)
            .await?
            .iter()
            .map(RegistryEntry::mirror_member)
            .collect();

        self.mirror
            .replace(device, &members)
            .await
            .map_err(|e| SyncError::Internal(format!("mirror rebuild for {}: {}", device, e)))?;
        tracing::info!(device = %device, members = members.len(), "Mirror rebuilt from registry");
        Ok(members.len())
    }

    /// Counts over every persisted partition, including devices not touched this process
    pub async fn stats(&self) -> SyncResult<RegistryStats> {
        let mut stats = RegistryStats::default();
        let mut dir = match tokio::fs::read_dir(&self.registry_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let count = match read_json::<Partition>(&path) {
                Ok(partition) => partition.map(|p| p.len()).unwrap_or(0),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Unreadable registry partition");
                    continue;
                }
            };
            stats.devices += 1;
            stats.total_entries += count;
            stats.per_device.insert(stem.to_string(), count);
        }

        Ok(stats)
    }
}
