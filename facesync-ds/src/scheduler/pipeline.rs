//! The sync cycle: roster → photos → devices → report

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use facesync_common::config::RootLayout;

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::models::{merge_roster, SyncReport};
use crate::scheduler::SyncCycle;
use crate::services::device_client::{DeviceApiFactory, DeviceTarget, HttpDeviceFactory};
use crate::services::image_cache::ImageCache;
use crate::services::mirror::{NoopMirror, RegistryMirror};
use crate::services::orchestrator::DeviceOrchestrator;
use crate::services::payload::PayloadPreparer;
use crate::services::registry::DeviceRegistry;
use crate::services::roster::RosterSource;
use crate::services::transcoder::Transcoder;

pub struct SyncPipeline {
    roster: Arc<dyn RosterSource>,
    preparer: PayloadPreparer,
    orchestrator: DeviceOrchestrator,
    devices: Vec<DeviceTarget>,
    prune_photos: bool,
}

impl SyncPipeline {
    pub fn new(
        roster: Arc<dyn RosterSource>,
        preparer: PayloadPreparer,
        orchestrator: DeviceOrchestrator,
        devices: Vec<DeviceTarget>,
    ) -> Self {
        Self {
            roster,
            preparer,
            orchestrator,
            devices,
            prune_photos: false,
        }
    }

    pub fn photo_cache(&self) -> Arc<ImageCache> {
        Arc::clone(self.preparer.cache())
    }

    pub fn with_photo_pruning(mut self, prune_photos: bool) -> Self {
        self.prune_photos = prune_photos;
        self
    }

    /// Wire the production pipeline from configuration
    pub fn from_config(
        config: &SyncConfig,
        layout: &RootLayout,
        registry: Arc<DeviceRegistry>,
    ) -> SyncResult<Self> {
        let factory: Arc<dyn DeviceApiFactory> =
            Arc::new(HttpDeviceFactory::new(config.device_settings()));
        Self::with_factory(config, layout, registry, factory)
    }

    /// Same wiring with a caller-supplied device factory
    pub fn with_factory(
        config: &SyncConfig,
        layout: &RootLayout,
        registry: Arc<DeviceRegistry>,
        factory: Arc<dyn DeviceApiFactory>,
    ) -> SyncResult<Self> {
        let cache = ImageCache::open(layout.photos_dir(), config.photo_download_timeout())?;
        let preparer = PayloadPreparer::new(
            Arc::new(cache),
            Transcoder::new(config.photo_envelope()),
            config.photos.max_concurrent_downloads,
        );
        let orchestrator =
            DeviceOrchestrator::new(registry, factory, config.orchestrator_options());

        Ok(Self::new(
            config.roster_source()?,
            preparer,
            orchestrator,
            config.device_targets(),
        )
        .with_photo_pruning(config.photos.prune_unused))
    }
}

#[async_trait]
impl SyncCycle for SyncPipeline {
    async fn run_cycle(&self) -> SyncResult<SyncReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(run_id = %run_id, devices = self.devices.len(), "Sync cycle started");

        let roster = merge_roster(self.roster.fetch().await?);
        let roster_size = roster.len();
        let roster_invites: HashSet<String> = roster
            .iter()
            .map(|entry| entry.identity.invite_id.clone())
            .collect();
        let photo_hashes: HashSet<String> = roster
            .iter()
            .filter_map(|entry| entry.photo_source_url.as_deref())
            .map(ImageCache::hash_for)
            .collect();

        let prepared = self.preparer.prepare(roster).await;
        let prepared_count = prepared.prepared.len();

        let outcome = self
            .orchestrator
            .run_batch(
                &self.devices,
                Arc::new(prepared.prepared),
                Arc::new(roster_invites),
            )
            .await;

        if self.prune_photos {
            if let Err(e) = self.preparer.cache().prune(&photo_hashes).await {
                tracing::warn!(error = %e, "Photo cache pruning failed");
            }
        }

        let report = SyncReport::assemble(
            run_id,
            started_at,
            roster_size,
            prepared_count,
            prepared.failures,
            outcome,
        );
        tracing::info!(run_id = %run_id, success = report.success, "{}", report.display_string());
        Ok(report)
    }
}

/// Registry for the layout, mirrored when configured
pub fn build_registry(config: &SyncConfig, layout: &RootLayout) -> SyncResult<Arc<DeviceRegistry>> {
    let registry = DeviceRegistry::new(layout.registry_dir(), layout.backups_dir())
        .with_max_backups(config.registry.max_backups)
        .with_mirror(build_mirror(config)?);
    Ok(Arc::new(registry))
}

/// Replay each device's registry partition into the mirror; returns the members written
pub async fn rebuild_mirrors(
    registry: &DeviceRegistry,
    devices: &[DeviceTarget],
) -> SyncResult<usize> {
    let mut members = 0;
    for target in devices {
        members += registry.rebuild_mirror(&target.address).await?;
    }
    Ok(members)
}

fn build_mirror(config: &SyncConfig) -> SyncResult<Arc<dyn RegistryMirror>> {
    match &config.mirror.redis_url {
        None => Ok(Arc::new(NoopMirror)),
        #[cfg(feature = "redis-mirror")]
        Some(url) => {
            let mirror = crate::services::mirror::RedisMirror::new(url)
                .map_err(|e| crate::error::SyncError::Config(format!("mirror.redis_url: {}", e)))?;
            tracing::info!("Registry mirror enabled (Redis)");
            Ok(Arc::new(mirror))
        }
        #[cfg(not(feature = "redis-mirror"))]
        Some(_) => {
            tracing::warn!(
                "mirror.redis_url is set but the redis-mirror feature is not built in, mirror disabled"
            );
            Ok(Arc::new(NoopMirror))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::models::{Contact, Identity, IdentityKind, RosterEntry};
    use crate::services::roster::FileRosterSource;

    struct FailingRoster;

    #[async_trait]
    impl RosterSource for FailingRoster {
        async fn fetch(&self) -> Result<Vec<RosterEntry>, SyncError> {
            Err(SyncError::Roster("connection refused".to_string()))
        }
    }

    fn config_toml(roster_file: &std::path::Path) -> SyncConfig {
        toml::from_str(&format!(
            r#"
            [roster]
            file = "{}"

            [[devices]]
            address = "127.0.0.1:9"

            [device_defaults]
            request_timeout_secs = 1
            settle_delay_ms = 0
            retry_attempts = 1
            "#,
            roster_file.display()
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_roster_failure_aborts_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RootLayout::new(dir.path());
        let config = config_toml(&dir.path().join("roster.json"));
        let registry = build_registry(&config, &layout).unwrap();

        let mut pipeline = SyncPipeline::from_config(&config, &layout, registry).unwrap();
        pipeline.roster = Arc::new(FailingRoster);

        assert!(matches!(pipeline.run_cycle().await, Err(SyncError::Roster(_))));
    }

    #[test]
    fn test_unusable_photo_dir_is_photo_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RootLayout::new(dir.path());
        std::fs::write(layout.photos_dir(), b"not a directory").unwrap();
        let config = config_toml(&dir.path().join("roster.json"));
        let registry = build_registry(&config, &layout).unwrap();

        let result = SyncPipeline::from_config(&config, &layout, registry);
        assert!(matches!(result, Err(SyncError::Photo(_))));
    }

    #[tokio::test]
    async fn test_rebuild_mirrors_covers_every_device() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RootLayout::new(dir.path());
        let config = config_toml(&dir.path().join("roster.json"));
        let registry = build_registry(&config, &layout).unwrap();
        let identity = Identity {
            identity_id: "u-1".to_string(),
            invite_id: "inv-1".to_string(),
            display_name: "One".to_string(),
            document_ref: None,
            contact: Contact::default(),
            kind: IdentityKind::Primary,
        };
        registry
            .upsert(
                "127.0.0.1:9",
                "inv-1",
                crate::services::registry::RegistryRecord::from_identity(&identity, true),
            )
            .await
            .unwrap();

        let members = rebuild_mirrors(&registry, &config.device_targets()).await.unwrap();
        assert_eq!(members, 1);
    }

    #[tokio::test]
    async fn test_identity_without_photo_is_processing_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RootLayout::new(dir.path());
        let roster_path = dir.path().join("roster.json");
        let entries = vec![RosterEntry {
            identity: Identity {
                identity_id: "u-1".to_string(),
                invite_id: "inv-1".to_string(),
                display_name: "One".to_string(),
                document_ref: None,
                contact: Contact::default(),
                kind: IdentityKind::Primary,
            },
            photo_source_url: None,
        }];
        std::fs::write(&roster_path, serde_json::to_vec(&entries).unwrap()).unwrap();

        let config = config_toml(&roster_path);
        let registry = build_registry(&config, &layout).unwrap();
        let pipeline = SyncPipeline::new(
            Arc::new(FileRosterSource::new(&roster_path)),
            PayloadPreparer::new(
                Arc::new(
                    ImageCache::open(layout.photos_dir(), config.photo_download_timeout())
                        .unwrap(),
                ),
                Transcoder::default(),
                1,
            ),
            DeviceOrchestrator::new(
                registry,
                Arc::new(HttpDeviceFactory::new(config.device_settings())),
                config.orchestrator_options(),
            ),
            config.device_targets(),
        );

        let report = pipeline.run_cycle().await.unwrap();
        assert_eq!(report.roster_size, 1);
        assert_eq!(report.prepared, 0);
        assert_eq!(report.totals.processing_errors, 1);
        assert_eq!(report.devices.len(), 1);
        assert!(!report.success);
    }
}
