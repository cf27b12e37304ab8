//! Roster sources
//!
//! Boundary adapters for the upstream identity store. Both return the raw list;
//! the pipeline applies `merge_roster` afterwards.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SyncError;
use crate::models::RosterEntry;

const USER_AGENT: &str = concat!("FaceSync-DeviceSync/", env!("CARGO_PKG_VERSION"));

#[async_trait]
pub trait RosterSource: Send + Sync {
    /// Fetch the desired roster; failure aborts the cycle
    async fn fetch(&self) -> Result<Vec<RosterEntry>, SyncError>;
}

/// `GET <url>?event=<event>` returning a JSON array of roster entries
pub struct HttpRosterSource {
    http_client: reqwest::Client,
    url: String,
    event: Option<String>,
    token: Option<String>,
}

impl HttpRosterSource {
    pub fn new(
        url: impl Into<String>,
        event: Option<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Roster(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            url: url.into(),
            event,
            token,
        })
    }
}

#[async_trait]
impl RosterSource for HttpRosterSource {
    async fn fetch(&self) -> Result<Vec<RosterEntry>, SyncError> {
        let mut request = self.http_client.get(&self.url);
        if let Some(event) = &self.event {
            request = request.query(&[("event", event)]);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Roster(format!("request to {} failed: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Roster(format!(
                "{} returned HTTP {}",
                self.url,
                status.as_u16()
            )));
        }

        let entries: Vec<RosterEntry> = response
            .json()
            .await
            .map_err(|e| SyncError::Roster(format!("invalid roster JSON: {}", e)))?;

        tracing::debug!(entries = entries.len(), "Fetched roster over HTTP");
        Ok(entries)
    }
}

/// JSON array of roster entries on local disk
pub struct FileRosterSource {
    path: PathBuf,
}

impl FileRosterSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RosterSource for FileRosterSource {
    async fn fetch(&self) -> Result<Vec<RosterEntry>, SyncError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            SyncError::Roster(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let entries: Vec<RosterEntry> = serde_json::from_slice(&bytes).map_err(|e| {
            SyncError::Roster(format!("invalid roster JSON in {}: {}", self.path.display(), e))
        })?;

        tracing::debug!(entries = entries.len(), path = %self.path.display(), "Loaded roster file");
        Ok(entries)
    }
}
