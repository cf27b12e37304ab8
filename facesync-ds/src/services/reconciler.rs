//! Reconciliation Engine
//!
//! Converges one device toward the prepared batch in strictly ordered phases:
//!
//! 1. **Inventory** - list enrolled records, index them by identity id
//! 2. **Classify** - identities whose registry entry matches, whose face was
//!    accepted and which the device still lists are verified and left alone
//! 3. **Delete** - clear existing records of every identity about to be enrolled
//!    (devices have no idempotent upsert), records of rotated identity ids, and
//!    records of registry entries whose invite left the roster; settle afterwards
//! 4. **Identities** - create in chunks of at most `MAX_BATCH`
//! 5. **Verify** - re-list; created identities the device does not show are
//!    excluded from the face phase and reported
//! 6. **Faces** - create for confirmed identities, same chunking
//! 7. **Commit** - upsert a registry entry for every identity in the batch, then
//!    drop entries of departed invites whose device records are confirmed gone
//!
//! Chunk and delete failures are counted and never stop later phases. Only fatal
//! device errors (rejected credentials) and registry write failures abort the device.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{SyncError, SyncResult};
use crate::models::{DeviceStats, Identity, PreparedIdentity};
use crate::services::device_client::{
    DeviceApi, DeviceError, DeviceRecord, FaceEnrollment, MAX_BATCH,
};
use crate::services::registry::{DeviceRegistry, RegistryEntry, RegistryRecord};

/// Reconciliation switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Re-enroll every identity even when verified
    pub force_resync: bool,
    /// Delete device records and registry entries of invites no longer in the roster
    pub prune_stale: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            force_resync: false,
            prune_stale: true,
        }
    }
}

/// Drives one device through a reconciliation pass
pub struct Reconciler {
    device: Arc<dyn DeviceApi>,
    registry: Arc<DeviceRegistry>,
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(
        device: Arc<dyn DeviceApi>,
        registry: Arc<DeviceRegistry>,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            device,
            registry,
            options,
        }
    }

    fn fatal(&self, err: DeviceError) -> SyncError {
        SyncError::device(self.device.address(), err)
    }

    /// Reconcile `batch` onto the device
    ///
    /// `roster_invites` is the invite set of the full roster, including identities
    /// whose photo could not be prepared this run; only invites outside it are pruned.
    pub async fn reconcile(
        &self,
        batch: &[PreparedIdentity],
        roster_invites: &HashSet<String>,
    ) -> SyncResult<DeviceStats> {
        let address = self.device.address().to_string();
        let mut stats = DeviceStats::default();

        // Phase 1: inventory. A failed listing leaves it incomplete, which blocks pruning.
        let (enrolled, inventory_complete) = match self.device.find_enrolled().await {
            Ok(records) => (records, true),
            Err(e) if e.is_fatal() => return Err(self.fatal(e)),
            Err(e) => {
                tracing::warn!(
                    device = %address,
                    error = %e,
                    "Inventory listing failed, assuming nothing enrolled"
                );
                stats.errors.push(format!("listing failed: {}", e));
                (Vec::new(), false)
            }
        };
        let by_identity = index_by_identity(&enrolled);
        let registry = self.registry.load(&address).await?;

        // Phase 2: classify
        let mut verified: Vec<&PreparedIdentity> = Vec::new();
        let mut to_enroll: Vec<&PreparedIdentity> = Vec::new();
        for prepared in batch {
            let entry = registry.get(&prepared.identity.invite_id);
            let on_device = by_identity.contains_key(prepared.identity.identity_id.as_str());
            if !self.options.force_resync
                && on_device
                && entry.is_some_and(|e| entry_matches(e, &prepared.identity))
            {
                verified.push(prepared);
            } else {
                to_enroll.push(prepared);
            }
        }
        stats.verified = verified.len();

        // Phase 3: delete
        let keep: HashSet<&str> = verified
            .iter()
            .map(|p| p.identity.identity_id.as_str())
            .collect();
        let mut doomed: Vec<&str> = Vec::new();
        for prepared in &to_enroll {
            doomed.push(&prepared.identity.identity_id);
            if let Some(entry) = registry.get(&prepared.identity.invite_id) {
                if entry.identity_id != prepared.identity.identity_id {
                    doomed.push(&entry.identity_id);
                }
            }
        }

        let mut stale: Vec<&RegistryEntry> = Vec::new();
        if self.options.prune_stale {
            for entry in registry.values() {
                if !roster_invites.contains(&entry.invite_id) {
                    doomed.push(&entry.identity_id);
                    stale.push(entry);
                }
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let deletions: Vec<&DeviceRecord> = doomed
            .into_iter()
            .filter(|id| !keep.contains(id) && seen.insert(*id))
            .flat_map(|id| by_identity.get(id).into_iter().flatten().copied())
            .collect();

        let mut deleted: HashSet<&str> = HashSet::new();
        for record in &deletions {
            match self.device.delete_record(&record.remote_record_id).await {
                Ok(true) => {
                    stats.users_deleted += 1;
                    deleted.insert(record.remote_record_id.as_str());
                }
                Ok(false) => {
                    stats.delete_failures += 1;
                    stats.errors.push(format!(
                        "delete of record {} ({}) refused",
                        record.remote_record_id, record.identity_id
                    ));
                }
                Err(e) if e.is_fatal() => return Err(self.fatal(e)),
                Err(e) => {
                    stats.delete_failures += 1;
                    stats.errors.push(format!(
                        "delete of record {} failed: {}",
                        record.remote_record_id, e
                    ));
                }
            }
        }
        if !deletions.is_empty() {
            tracing::info!(
                device = %address,
                deleted = stats.users_deleted,
                failures = stats.delete_failures,
                "Delete phase complete"
            );
            self.device.settle().await;
        }

        // Phase 4: identities
        for chunk in to_enroll.chunks(MAX_BATCH) {
            let identities: Vec<Identity> = chunk.iter().map(|p| p.identity.clone()).collect();
            match self.device.create_identities(&identities).await {
                Ok(outcome) => {
                    stats.users_registered += outcome.success_count;
                    if !outcome.is_success() {
                        stats.identity_chunk_failures += 1;
                        stats
                            .errors
                            .push(format!("identity chunk of {} rejected", chunk.len()));
                    }
                }
                Err(e) if e.is_fatal() => return Err(self.fatal(e)),
                Err(e) => {
                    stats.identity_chunk_failures += 1;
                    stats
                        .errors
                        .push(format!("identity chunk of {} failed: {}", chunk.len(), e));
                }
            }
        }

        // Phase 5: verify
        let mut confirmed: Vec<&PreparedIdentity> = Vec::new();
        if !to_enroll.is_empty() {
            let relisted = self.device.list_enrolled().await.map_err(|e| self.fatal(e))?;
            let present: HashSet<&str> = relisted.iter().map(|r| r.identity_id.as_str()).collect();
            for prepared in &to_enroll {
                if present.contains(prepared.identity.identity_id.as_str()) {
                    confirmed.push(*prepared);
                } else {
                    stats.unconfirmed.push(prepared.identity.identity_id.clone());
                }
            }
            if !stats.unconfirmed.is_empty() {
                tracing::warn!(
                    device = %address,
                    unconfirmed = stats.unconfirmed.len(),
                    "Created identities missing on re-list, skipping their faces"
                );
            }
        }

        // Phase 6: faces
        let mut faces_accepted: HashSet<&str> = HashSet::new();
        for chunk in confirmed.chunks(MAX_BATCH) {
            let faces: Vec<FaceEnrollment> = chunk
                .iter()
                .map(|p| FaceEnrollment {
                    identity_id: p.identity.identity_id.clone(),
                    photo_base64: p.photo.base64.clone(),
                })
                .collect();
            match self.device.create_faces(&faces).await {
                Ok(outcome) => {
                    stats.faces_registered += outcome.success_count;
                    if outcome.is_success() {
                        faces_accepted.extend(chunk.iter().map(|p| p.identity.identity_id.as_str()));
                    } else {
                        stats.face_chunk_failures += 1;
                        stats
                            .errors
                            .push(format!("face chunk of {} rejected", chunk.len()));
                    }
                }
                Err(e) if e.is_fatal() => return Err(self.fatal(e)),
                Err(e) => {
                    stats.face_chunk_failures += 1;
                    stats
                        .errors
                        .push(format!("face chunk of {} failed: {}", chunk.len(), e));
                }
            }
        }

        // Phase 7: commit. Intent is recorded for every identity; face_enrolled keeps
        // failed ones out of the verified set next run.
        let records: Vec<(String, RegistryRecord)> = batch
            .iter()
            .map(|p| {
                let id = p.identity.identity_id.as_str();
                let face_enrolled = keep.contains(id) || faces_accepted.contains(id);
                (
                    p.identity.invite_id.clone(),
                    RegistryRecord::from_identity(&p.identity, face_enrolled),
                )
            })
            .collect();
        stats.cache_saves = self.registry.upsert_many(&address, records).await?.len();

        // A departed invite leaves the registry only once the device is known to be
        // rid of it, otherwise the next run would never retry the delete.
        let stale_invites: Vec<String> = stale
            .iter()
            .filter(|entry| {
                let id = entry.identity_id.as_str();
                keep.contains(id)
                    || (inventory_complete
                        && by_identity.get(id).map_or(true, |records| {
                            records
                                .iter()
                                .all(|r| deleted.contains(r.remote_record_id.as_str()))
                        }))
            })
            .map(|entry| entry.invite_id.clone())
            .collect();
        stats.prune_deferred = stale.len() - stale_invites.len();
        if stats.prune_deferred > 0 {
            tracing::warn!(
                device = %address,
                deferred = stats.prune_deferred,
                "Departed invites kept in registry until their device records are gone"
            );
        }
        if !stale_invites.is_empty() {
            stats.users_pruned = self.registry.remove_many(&address, &stale_invites).await?.len();
        }

        tracing::info!(device = %address, "{}", stats.display_string());
        Ok(stats)
    }
}

fn index_by_identity(records: &[DeviceRecord]) -> HashMap<&str, Vec<&DeviceRecord>> {
    let mut index: HashMap<&str, Vec<&DeviceRecord>> = HashMap::new();
    for record in records {
        index
            .entry(record.identity_id.as_str())
            .or_default()
            .push(record);
    }
    index
}

/// Registry entry still describes what the roster wants
fn entry_matches(entry: &RegistryEntry, identity: &Identity) -> bool {
    entry.face_enrolled
        && entry.identity_id == identity.identity_id
        && entry.display_name == identity.display_name
        && entry.document_ref == identity.document_ref
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Contact, IdentityKind};
    use crate::services::device_client::ChunkOutcome;
    use crate::services::transcoder::ProcessedPhoto;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeState {
        records: Vec<DeviceRecord>,
        next_rec_no: u32,
        /// Identity ids the device silently fails to store
        drop_ids: HashSet<String>,
        reject_auth: bool,
        /// Listing fails with a transport error
        listing_down: bool,
        /// Deletes answer something other than `OK`
        refuse_deletes: bool,
        deletes: Vec<String>,
        identity_chunks: Vec<usize>,
        face_chunks: Vec<usize>,
        settles: usize,
    }

    struct FakeDevice {
        state: Mutex<FakeState>,
    }

    impl FakeDevice {
        fn new(enrolled: &[&str]) -> Arc<Self> {
            let mut state = FakeState::default();
            for id in enrolled {
                state.next_rec_no += 1;
                state.records.push(DeviceRecord {
                    remote_record_id: state.next_rec_no.to_string(),
                    identity_id: id.to_string(),
                    display_name: String::new(),
                });
            }
            Arc::new(Self {
                state: Mutex::new(state),
            })
        }
    }

    #[async_trait]
    impl DeviceApi for FakeDevice {
        fn address(&self) -> &str {
            "fake-device"
        }

        async fn find_enrolled(&self) -> Result<Vec<DeviceRecord>, DeviceError> {
            let state = self.state.lock().unwrap();
            if state.reject_auth {
                return Err(DeviceError::Auth("bad password".to_string()));
            }
            if state.listing_down {
                return Err(DeviceError::Transport("connection reset".to_string()));
            }
            Ok(state.records.clone())
        }

        async fn delete_record(&self, remote_record_id: &str) -> Result<bool, DeviceError> {
            let mut state = self.state.lock().unwrap();
            state.deletes.push(remote_record_id.to_string());
            if state.refuse_deletes {
                return Ok(false);
            }
            let before = state.records.len();
            state.records.retain(|r| r.remote_record_id != remote_record_id);
            Ok(state.records.len() < before)
        }

        async fn create_identities(&self, batch: &[Identity]) -> Result<ChunkOutcome, DeviceError> {
            assert!(batch.len() <= MAX_BATCH);
            let mut state = self.state.lock().unwrap();
            state.identity_chunks.push(batch.len());
            for identity in batch {
                if state.drop_ids.contains(&identity.identity_id) {
                    continue;
                }
                state.next_rec_no += 1;
                let rec_no = state.next_rec_no.to_string();
                state.records.push(DeviceRecord {
                    remote_record_id: rec_no,
                    identity_id: identity.identity_id.clone(),
                    display_name: identity.display_name.clone(),
                });
            }
            Ok(ChunkOutcome {
                attempted: batch.len(),
                success_count: batch.len(),
            })
        }

        async fn create_faces(&self, batch: &[FaceEnrollment]) -> Result<ChunkOutcome, DeviceError> {
            assert!(batch.len() <= MAX_BATCH);
            self.state.lock().unwrap().face_chunks.push(batch.len());
            Ok(ChunkOutcome {
                attempted: batch.len(),
                success_count: batch.len(),
            })
        }

        async fn settle(&self) {
            self.state.lock().unwrap().settles += 1;
        }
    }

    fn prepared(n: usize) -> Vec<PreparedIdentity> {
        (0..n)
            .map(|i| PreparedIdentity {
                identity: Identity {
                    identity_id: format!("u-{}", i),
                    invite_id: format!("inv-{}", i),
                    display_name: format!("Person {}", i),
                    document_ref: None,
                    contact: Contact::default(),
                    kind: IdentityKind::Primary,
                },
                photo: ProcessedPhoto {
                    base64: "AAAA".to_string(),
                    byte_len: 3,
                    width: 1,
                    height: 1,
                    quality: 90,
                },
            })
            .collect()
    }

    fn invites(batch: &[PreparedIdentity]) -> HashSet<String> {
        batch.iter().map(|p| p.identity.invite_id.clone()).collect()
    }

    fn registry(dir: &std::path::Path) -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry::new(
            dir.join("registry"),
            dir.join("registry/backups"),
        ))
    }

    #[tokio::test]
    async fn test_twenty_three_identity_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let device = FakeDevice::new(&["u-0", "u-1", "u-2", "u-3", "u-4"]);
        {
            let mut state = device.state.lock().unwrap();
            state.drop_ids.insert("u-7".to_string());
            state.drop_ids.insert("u-19".to_string());
        }

        let batch = prepared(23);
        let reconciler = Reconciler::new(device.clone(), registry.clone(), ReconcileOptions::default());
        let stats = reconciler.reconcile(&batch, &invites(&batch)).await.unwrap();

        assert_eq!(stats.verified, 0);
        assert_eq!(stats.users_deleted, 5);
        assert_eq!(stats.users_registered, 23);
        assert_eq!(stats.unconfirmed, vec!["u-7".to_string(), "u-19".to_string()]);
        assert_eq!(stats.faces_registered, 21);
        assert_eq!(stats.cache_saves, 23);

        let state = device.state.lock().unwrap();
        assert_eq!(state.deletes.len(), 5);
        assert_eq!(state.identity_chunks, vec![10, 10, 3]);
        assert_eq!(state.face_chunks, vec![10, 10, 1]);
        assert_eq!(state.settles, 1);
        drop(state);

        let entries = registry.load("fake-device").await.unwrap();
        assert_eq!(entries.len(), 23);
        assert!(!entries["inv-7"].face_enrolled);
        assert!(entries["inv-8"].face_enrolled);
    }

    #[tokio::test]
    async fn test_second_run_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let device = FakeDevice::new(&[]);
        let batch = prepared(12);
        let reconciler = Reconciler::new(device.clone(), registry, ReconcileOptions::default());

        reconciler.reconcile(&batch, &invites(&batch)).await.unwrap();
        let second = reconciler.reconcile(&batch, &invites(&batch)).await.unwrap();

        assert_eq!(second.verified, 12);
        assert_eq!(second.users_deleted, 0);
        assert_eq!(second.users_registered, 0);
        assert_eq!(second.cache_saves, 12);

        let state = device.state.lock().unwrap();
        assert_eq!(state.identity_chunks, vec![10, 2]);
        assert_eq!(state.records.len(), 12);
    }

    #[tokio::test]
    async fn test_unconfirmed_identity_retried_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let device = FakeDevice::new(&[]);
        device.state.lock().unwrap().drop_ids.insert("u-1".to_string());
        let batch = prepared(3);
        let reconciler = Reconciler::new(device.clone(), registry, ReconcileOptions::default());

        reconciler.reconcile(&batch, &invites(&batch)).await.unwrap();
        device.state.lock().unwrap().drop_ids.clear();
        let second = reconciler.reconcile(&batch, &invites(&batch)).await.unwrap();

        assert_eq!(second.verified, 2);
        assert_eq!(second.users_registered, 1);
        assert!(second.unconfirmed.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_count_is_ceiling_of_batch_over_ten() {
        for n in [1usize, 9, 10, 11, 20, 21] {
            let dir = tempfile::tempdir().unwrap();
            let device = FakeDevice::new(&[]);
            let batch = prepared(n);
            Reconciler::new(device.clone(), registry(dir.path()), ReconcileOptions::default())
                .reconcile(&batch, &invites(&batch))
                .await
                .unwrap();

            let state = device.state.lock().unwrap();
            assert_eq!(state.identity_chunks.len(), n.div_ceil(MAX_BATCH), "n = {}", n);
            assert_eq!(state.identity_chunks.iter().sum::<usize>(), n);
        }
    }

    #[tokio::test]
    async fn test_departed_invite_pruned_from_device_and_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let device = FakeDevice::new(&[]);
        let reconciler = Reconciler::new(device.clone(), registry.clone(), ReconcileOptions::default());

        let full = prepared(3);
        reconciler.reconcile(&full, &invites(&full)).await.unwrap();

        let remaining = &full[..2];
        let stats = reconciler
            .reconcile(remaining, &invites(remaining))
            .await
            .unwrap();

        assert_eq!(stats.verified, 2);
        assert_eq!(stats.users_deleted, 1);
        assert_eq!(stats.users_pruned, 1);
        assert!(!registry.contains("fake-device", "inv-2").await.unwrap());
        let state = device.state.lock().unwrap();
        assert!(state.records.iter().all(|r| r.identity_id != "u-2"));
    }

    #[tokio::test]
    async fn test_refused_delete_keeps_departed_invite_until_device_confirms() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let device = FakeDevice::new(&[]);
        let reconciler = Reconciler::new(device.clone(), registry.clone(), ReconcileOptions::default());

        let full = prepared(3);
        reconciler.reconcile(&full, &invites(&full)).await.unwrap();

        let remaining = &full[..2];
        device.state.lock().unwrap().refuse_deletes = true;
        let refused = reconciler
            .reconcile(remaining, &invites(remaining))
            .await
            .unwrap();

        assert_eq!(refused.delete_failures, 1);
        assert_eq!(refused.users_pruned, 0);
        assert_eq!(refused.prune_deferred, 1);
        assert!(registry.contains("fake-device", "inv-2").await.unwrap());
        assert!(device
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .any(|r| r.identity_id == "u-2"));

        device.state.lock().unwrap().refuse_deletes = false;
        let retried = reconciler
            .reconcile(remaining, &invites(remaining))
            .await
            .unwrap();

        assert_eq!(retried.users_deleted, 1);
        assert_eq!(retried.users_pruned, 1);
        assert_eq!(retried.prune_deferred, 0);
        assert!(!registry.contains("fake-device", "inv-2").await.unwrap());
        let state = device.state.lock().unwrap();
        assert!(state.records.iter().all(|r| r.identity_id != "u-2"));
    }

    #[tokio::test]
    async fn test_failed_listing_never_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let device = FakeDevice::new(&[]);
        let reconciler = Reconciler::new(device.clone(), registry.clone(), ReconcileOptions::default());

        let full = prepared(3);
        reconciler.reconcile(&full, &invites(&full)).await.unwrap();

        device.state.lock().unwrap().listing_down = true;
        let remaining = &full[..2];
        let stats = reconciler
            .reconcile(remaining, &invites(remaining))
            .await
            .unwrap();

        assert_eq!(stats.users_pruned, 0);
        assert_eq!(stats.prune_deferred, 1);
        assert!(stats.errors.iter().any(|e| e.starts_with("listing failed")));
        assert!(registry.contains("fake-device", "inv-2").await.unwrap());
        assert!(device.state.lock().unwrap().deletes.is_empty());
    }

    #[tokio::test]
    async fn test_rotated_identity_id_replaces_old_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let device = FakeDevice::new(&[]);
        let reconciler = Reconciler::new(device.clone(), registry.clone(), ReconcileOptions::default());

        let mut batch = prepared(1);
        reconciler.reconcile(&batch, &invites(&batch)).await.unwrap();

        batch[0].identity.identity_id = "u-0-rotated".to_string();
        let stats = reconciler.reconcile(&batch, &invites(&batch)).await.unwrap();

        assert_eq!(stats.users_deleted, 1);
        assert_eq!(stats.users_registered, 1);
        let ids: Vec<String> = device
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .map(|r| r.identity_id.clone())
            .collect();
        assert_eq!(ids, vec!["u-0-rotated".to_string()]);
        let entries = registry.load("fake-device").await.unwrap();
        assert_eq!(entries["inv-0"].identity_id, "u-0-rotated");
    }

    #[tokio::test]
    async fn test_auth_rejection_aborts_device() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new(&[]);
        device.state.lock().unwrap().reject_auth = true;
        let batch = prepared(2);

        let result = Reconciler::new(device, registry(dir.path()), ReconcileOptions::default())
            .reconcile(&batch, &invites(&batch))
            .await;
        assert!(matches!(result, Err(SyncError::Device { .. })));
    }
}
