//! Content-addressed photo cache
//!
//! Photos are stored as `<sha256(url)>.jpg`, so a lookup never needs the bytes:
//! a photo is downloaded at most once per source URL. `metadata.json` maps each
//! hash to `{url, identityId, downloadedAt, size}` and is rewritten atomically
//! after every download.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use facesync_common::{fs as state_fs, hash};

const USER_AGENT: &str = concat!("FaceSync-PhotoCache/", env!("CARGO_PKG_VERSION"));
const METADATA_FILE: &str = "metadata.json";
const PHOTO_EXTENSION: &str = "jpg";

/// Photo fetch and normalization errors
#[derive(Debug, Error)]
pub enum PhotoError {
    #[error("Download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("Download of {url} timed out")]
    DownloadTimeout { url: String },

    #[error("Download of {url} returned HTTP {status}")]
    DownloadStatus { url: String, status: u16 },

    #[error("Identity has no photo source URL")]
    MissingSource,

    #[error("Image decode error: {0}")]
    Decode(String),

    /// Smallest encoding achieved still exceeds the bound
    #[error("Photo cannot be shrunk below {limit} bytes (smallest {bytes})")]
    SizeViolation { bytes: usize, limit: usize },

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache state error: {0}")]
    State(#[from] facesync_common::Error),
}

/// Metadata for one cached photo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoMetadata {
    pub url: String,
    pub identity_id: String,
    pub downloaded_at: DateTime<Utc>,
    pub size: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub photos: usize,
    pub total_bytes: u64,
}

/// Local store of source photos keyed by URL hash
pub struct ImageCache {
    dir: PathBuf,
    metadata_path: PathBuf,
    http_client: reqwest::Client,
    metadata: Mutex<BTreeMap<String, PhotoMetadata>>,
}

impl ImageCache {
    /// Open (or create) a cache directory
    pub fn open(dir: impl Into<PathBuf>, download_timeout: Duration) -> Result<Self, PhotoError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let metadata_path = dir.join(METADATA_FILE);
        let metadata = match state_fs::read_json(&metadata_path) {
            Ok(existing) => existing.unwrap_or_default(),
            Err(e) => {
                // Photo files are still valid; metadata is rebuilt as photos are fetched
                tracing::warn!(
                    path = %metadata_path.display(),
                    error = %e,
                    "Unreadable photo metadata, starting fresh"
                );
                BTreeMap::new()
            }
        };

        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(download_timeout)
            .build()
            .map_err(|e| PhotoError::Download {
                url: String::new(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            dir,
            metadata_path,
            http_client,
            metadata: Mutex::new(metadata),
        })
    }

    /// Content hash of a source URL
    pub fn hash_for(url: &str) -> String {
        hash::sha256_hex(url)
    }

    /// Local path a URL is cached under (whether or not it exists yet)
    pub fn path_for(&self, url: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", Self::hash_for(url), PHOTO_EXTENSION))
    }

    /// Return the local copy of `url`, downloading it only if absent
    pub async fn ensure_local(&self, url: &str, identity_id: &str) -> Result<PathBuf, PhotoError> {
        let path = self.path_for(url);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::trace!(identity = %identity_id, "Photo cache hit");
            return Ok(path);
        }

        let bytes = self.fetch(url).await?;
        state_fs::atomic_write(&path, &bytes)?;

        let mut metadata = self.metadata.lock().await;
        metadata.insert(
            Self::hash_for(url),
            PhotoMetadata {
                url: url.to_string(),
                identity_id: identity_id.to_string(),
                downloaded_at: Utc::now(),
                size: bytes.len() as u64,
            },
        );
        state_fs::write_json_atomic(&self.metadata_path, &*metadata)?;

        tracing::debug!(
            identity = %identity_id,
            bytes = bytes.len(),
            "Photo downloaded into cache"
        );
        Ok(path)
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, PhotoError> {
        if let Some(local) = url.strip_prefix("file://") {
            return Ok(tokio::fs::read(Path::new(local)).await?);
        }

        let response = self.http_client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                PhotoError::DownloadTimeout {
                    url: url.to_string(),
                }
            } else {
                PhotoError::Download {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PhotoError::DownloadStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                PhotoError::DownloadTimeout {
                    url: url.to_string(),
                }
            } else {
                PhotoError::Download {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        Ok(bytes.to_vec())
    }

    /// Metadata recorded for a URL, if it was downloaded by this cache
    pub async fn metadata_for(&self, url: &str) -> Option<PhotoMetadata> {
        self.metadata.lock().await.get(&Self::hash_for(url)).cloned()
    }

    /// Forget a cached photo so the next `ensure_local` downloads it again
    pub async fn evict(&self, url: &str) -> Result<bool, PhotoError> {
        let removed = match tokio::fs::remove_file(self.path_for(url)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        let mut metadata = self.metadata.lock().await;
        if metadata.remove(&Self::hash_for(url)).is_some() {
            state_fs::write_json_atomic(&self.metadata_path, &*metadata)?;
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats, PhotoError> {
        let mut stats = CacheStats::default();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(PHOTO_EXTENSION) {
                stats.photos += 1;
                stats.total_bytes += entry.metadata().await?.len();
            }
        }
        Ok(stats)
    }

    /// Delete cached photos whose hash is not in `keep`; returns the number removed
    pub async fn prune(&self, keep: &HashSet<String>) -> Result<usize, PhotoError> {
        let mut removed = 0;
        let mut metadata = self.metadata.lock().await;

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PHOTO_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };
            if keep.contains(&stem) {
                continue;
            }
            tokio::fs::remove_file(&path).await?;
            metadata.remove(&stem);
            removed += 1;
        }

        if removed > 0 {
            state_fs::write_json_atomic(&self.metadata_path, &*metadata)?;
            tracing::info!(removed, "Pruned unused photos from cache");
        }
        Ok(removed)
    }
}
