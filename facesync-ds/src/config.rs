//! Service configuration for facesync-ds
//!
//! Loaded from TOML (see `facesync_common::config::locate_config_file` for the
//! search order). Every section is optional and falls back to the defaults below;
//! `validate` rejects configurations that cannot run a cycle.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::SyncError;
use crate::services::device_client::{Credentials, DeviceSettings, DeviceTarget};
use crate::services::orchestrator::OrchestratorOptions;
use crate::services::reconciler::ReconcileOptions;
use crate::services::roster::{FileRosterSource, HttpRosterSource, RosterSource};
use crate::services::transcoder::PhotoEnvelope;

/// Overrides `[device_defaults] password`
pub const DEVICE_PASSWORD_ENV: &str = "FACESYNC_DEVICE_PASSWORD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub root_folder: Option<PathBuf>,
    pub schedule: ScheduleConfig,
    pub roster: RosterConfig,
    pub device_defaults: DeviceDefaults,
    pub devices: Vec<DeviceEntry>,
    pub photos: PhotoConfig,
    pub registry: RegistryConfig,
    pub mirror: MirrorConfig,
    pub http: HttpConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    /// Run a cycle immediately instead of waiting one interval
    pub run_on_start: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            run_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    pub url: Option<String>,
    pub file: Option<PathBuf>,
    /// Upstream event filter (`event` query parameter)
    pub event: Option<String>,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            url: None,
            file: None,
            event: None,
            token: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceDefaults {
    pub username: String,
    pub password: String,
    pub request_timeout_secs: u64,
    pub settle_delay_ms: u64,
    pub max_records: usize,
    pub max_photo_width: u32,
    pub max_photo_height: u32,
    pub retry_attempts: u32,
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: String::new(),
            request_timeout_secs: 30,
            settle_delay_ms: 1500,
            max_records: 5000,
            max_photo_width: 1080,
            max_photo_height: 1920,
            retry_attempts: 3,
        }
    }
}

/// One `[[devices]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotoConfig {
    pub download_timeout_secs: u64,
    pub max_concurrent_downloads: usize,
    /// Delete cached photos no longer referenced by the roster after each cycle
    pub prune_unused: bool,
}

impl Default for PhotoConfig {
    fn default() -> Self {
        Self {
            download_timeout_secs: 20,
            max_concurrent_downloads: 4,
            prune_unused: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_backups: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_backups: 10 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// `redis://host:port/db`; requires the `redis-mirror` feature
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5780".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub device_timeout_secs: u64,
    /// 0 = unlimited
    pub max_parallel_devices: usize,
    pub force_resync: bool,
    pub prune_stale: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            device_timeout_secs: 900,
            max_parallel_devices: 0,
            force_resync: false,
            prune_stale: true,
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        facesync_common::config::load_toml(path).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.devices.is_empty() {
            return Err(SyncError::Config(
                "at least one [[devices]] entry is required".to_string(),
            ));
        }
        if let Some(device) = self.devices.iter().find(|d| d.address.trim().is_empty()) {
            return Err(SyncError::Config(format!(
                "device {:?} has an empty address",
                device.name
            )));
        }
        if self.schedule.interval_secs == 0 {
            return Err(SyncError::Config(
                "schedule.interval_secs must be greater than 0".to_string(),
            ));
        }
        match (&self.roster.url, &self.roster.file) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => {
                return Err(SyncError::Config(
                    "exactly one of roster.url or roster.file must be set".to_string(),
                ))
            }
        }
        if self.orchestrator.device_timeout_secs == 0 {
            return Err(SyncError::Config(
                "orchestrator.device_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured devices with defaults and the password override applied
    pub fn device_targets(&self) -> Vec<DeviceTarget> {
        let default_password = std::env::var(DEVICE_PASSWORD_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.device_defaults.password.clone());

        self.devices
            .iter()
            .map(|device| DeviceTarget {
                address: device.address.trim().to_string(),
                name: device.name.clone(),
                credentials: Credentials {
                    username: device
                        .username
                        .clone()
                        .unwrap_or_else(|| self.device_defaults.username.clone()),
                    password: device
                        .password
                        .clone()
                        .unwrap_or_else(|| default_password.clone()),
                },
            })
            .collect()
    }

    pub fn device_settings(&self) -> DeviceSettings {
        let defaults = &self.device_defaults;
        DeviceSettings {
            request_timeout: Duration::from_secs(defaults.request_timeout_secs),
            settle_delay: Duration::from_millis(defaults.settle_delay_ms),
            max_records: defaults.max_records,
            retry: crate::utils::RetryPolicy {
                max_attempts: defaults.retry_attempts.max(1),
                ..Default::default()
            },
        }
    }

    pub fn photo_envelope(&self) -> PhotoEnvelope {
        PhotoEnvelope {
            max_width: self.device_defaults.max_photo_width,
            max_height: self.device_defaults.max_photo_height,
            ..Default::default()
        }
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            device_timeout: Duration::from_secs(self.orchestrator.device_timeout_secs),
            max_parallel_devices: self.orchestrator.max_parallel_devices,
            reconcile: ReconcileOptions {
                force_resync: self.orchestrator.force_resync,
                prune_stale: self.orchestrator.prune_stale,
            },
        }
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.interval_secs)
    }

    pub fn photo_download_timeout(&self) -> Duration {
        Duration::from_secs(self.photos.download_timeout_secs)
    }

    /// Build the configured roster source
    pub fn roster_source(&self) -> Result<Arc<dyn RosterSource>, SyncError> {
        match (&self.roster.url, &self.roster.file) {
            (Some(url), None) => Ok(Arc::new(HttpRosterSource::new(
                url.clone(),
                self.roster.event.clone(),
                self.roster.token.clone(),
                Duration::from_secs(self.roster.timeout_secs),
            )?)),
            (None, Some(file)) => Ok(Arc::new(FileRosterSource::new(file.clone()))),
            _ => Err(SyncError::Config(
                "exactly one of roster.url or roster.file must be set".to_string(),
            )),
        }
    }
}
