//! Service modules for the device sync engine
//!
//! Leaf-first: photo cache and transcoder, registry and its mirror, the device
//! client, then the reconciler and orchestrator that drive them.

pub mod device_client;
pub mod image_cache;
pub mod mirror;
pub mod orchestrator;
pub mod payload;
pub mod reconciler;
pub mod registry;
pub mod roster;
pub mod transcoder;

pub use device_client::{
    ChunkOutcome, Credentials, DeviceApi, DeviceApiFactory, DeviceClient, DeviceError,
    DeviceRecord, DeviceSettings, DeviceTarget, FaceEnrollment, HttpDeviceFactory, MAX_BATCH,
};
pub use image_cache::{CacheStats, ImageCache, PhotoError, PhotoMetadata};
pub use mirror::{MirrorError, NoopMirror, RegistryMirror};
pub use orchestrator::{DeviceOrchestrator, OrchestratorOptions};
pub use payload::{PayloadPreparer, PreparedRoster};
pub use reconciler::{ReconcileOptions, Reconciler};
pub use registry::{DeviceRegistry, RegistryEntry, RegistryRecord, RegistryStats};
pub use roster::{FileRosterSource, HttpRosterSource, RosterSource};
pub use transcoder::{PhotoEnvelope, ProcessedPhoto, Transcoder};

#[cfg(feature = "redis-mirror")]
pub use mirror::RedisMirror;
