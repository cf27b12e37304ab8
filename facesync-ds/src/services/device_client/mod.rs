//! Device enrollment API client
//!
//! Talks to one access-control terminal over its CGI enrollment API:
//! - `recordFinder.cgi` - list enrolled identities (line-oriented reply)
//! - `recordUpdater.cgi` - delete one record by record number
//! - `AccessUser.cgi` - bulk-create identities (≤10 per call)
//! - `AccessFace.cgi` - bulk-create faces (≤10 per call)
//!
//! Every call is digest-authenticated from scratch, bounded by a fixed timeout and
//! wrapped in the client's `RetryPolicy` (transport failures only).

pub mod digest;
pub mod records;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::models::Identity;
use crate::utils::{RetryPolicy, Retryable};

pub use digest::{Credentials, DigestChallenge};
pub use records::{parse_device_records, DeviceRecord};

const USER_AGENT: &str = concat!("FaceSync-DeviceSync/", env!("CARGO_PKG_VERSION"));

/// Maximum identities or faces per bulk call
pub const MAX_BATCH: usize = 10;

/// Validity window written for every identity (effectively unbounded)
const VALID_FROM: &str = "1970-01-01 00:00:00";
const VALID_TO: &str = "2037-12-31 23:59:59";

/// Device client errors
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Connection refused, reset, DNS failure
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    /// Credentials rejected or no usable challenge
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Device replied with an unexpected status
    #[error("HTTP {0}: {1}")]
    Status(u16, String),

    /// Reply could not be interpreted
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Batch of {0} exceeds the device limit of 10")]
    InvalidBatch(usize),
}

impl DeviceError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeviceError::Timeout
        } else {
            DeviceError::Transport(err.to_string())
        }
    }

    /// Errors that make further calls to this device pointless
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::Auth(_))
    }
}

impl Retryable for DeviceError {
    fn is_retryable(&self) -> bool {
        match self {
            DeviceError::Transport(_) | DeviceError::Timeout => true,
            DeviceError::Status(code, _) => *code >= 500,
            _ => false,
        }
    }
}

/// Result of one bulk call; chunks are all-or-nothing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub attempted: usize,
    pub success_count: usize,
}

impl ChunkOutcome {
    fn judged(attempted: usize, ok: bool) -> Self {
        Self {
            attempted,
            success_count: if ok { attempted } else { 0 },
        }
    }

    pub fn is_success(&self) -> bool {
        self.success_count == self.attempted
    }
}

/// Face payload keyed by the identity id used in `create_identities`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceEnrollment {
    pub identity_id: String,
    pub photo_base64: String,
}

/// Address and credentials of one device
#[derive(Debug, Clone)]
pub struct DeviceTarget {
    /// Registry partition key and base address (`10.0.0.5` or `http://10.0.0.5:8080`)
    pub address: String,
    pub name: Option<String>,
    pub credentials: Credentials,
}

impl DeviceTarget {
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    fn base_url(&self) -> String {
        let address = self.address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        }
    }
}

/// Per-call behaviour shared by all device clients
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub request_timeout: Duration,
    /// Pause after delete-heavy phases so device state settles
    pub settle_delay: Duration,
    /// `count` parameter of the find query
    pub max_records: usize,
    pub retry: RetryPolicy,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_millis(1500),
            max_records: 5000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Enrollment operations one device supports
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Registry partition key
    fn address(&self) -> &str;

    /// Enrolled identities; every failure surfaces as `Err`
    async fn find_enrolled(&self) -> Result<Vec<DeviceRecord>, DeviceError>;

    /// Enrolled identities; empty on transport/protocol failure, `Err` only when fatal
    async fn list_enrolled(&self) -> Result<Vec<DeviceRecord>, DeviceError> {
        match self.find_enrolled().await {
            Ok(records) => Ok(records),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(
                    device = %self.address(),
                    error = %e,
                    "Listing failed, assuming nothing enrolled"
                );
                Ok(Vec::new())
            }
        }
    }

    /// True iff the device replied exactly `OK`
    async fn delete_record(&self, remote_record_id: &str) -> Result<bool, DeviceError>;

    async fn create_identities(&self, batch: &[Identity]) -> Result<ChunkOutcome, DeviceError>;

    async fn create_faces(&self, batch: &[FaceEnrollment]) -> Result<ChunkOutcome, DeviceError>;

    /// Let device-side state settle after deletes
    async fn settle(&self);
}

/// Creates a `DeviceApi` for a configured device
pub trait DeviceApiFactory: Send + Sync {
    fn connect(&self, target: &DeviceTarget) -> Result<Arc<dyn DeviceApi>, DeviceError>;
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UserListRequest<'a> {
    user_list: Vec<UserPayload<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UserPayload<'a> {
    #[serde(rename = "UserID")]
    user_id: &'a str,
    user_name: &'a str,
    user_type: u8,
    user_status: u8,
    authority: u8,
    doors: [u8; 1],
    time_sections: [u8; 1],
    valid_from: &'static str,
    valid_to: &'static str,
    #[serde(rename = "CitizenIDNo", skip_serializing_if = "Option::is_none")]
    citizen_id_no: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct FaceListRequest<'a> {
    face_list: Vec<FacePayload<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct FacePayload<'a> {
    #[serde(rename = "UserID")]
    user_id: &'a str,
    photo_data: [&'a str; 1],
}

fn user_payload(identity: &Identity) -> UserPayload<'_> {
    UserPayload {
        user_id: &identity.identity_id,
        user_name: &identity.display_name,
        user_type: 0,
        user_status: 0,
        authority: 2,
        doors: [0],
        time_sections: [255],
        valid_from: VALID_FROM,
        valid_to: VALID_TO,
        citizen_id_no: identity.document_ref.as_deref(),
    }
}

/// Plain-text success marker of every mutating endpoint
fn is_ok_reply(body: &str) -> bool {
    body.trim() == "OK"
}

/// Digest-authenticated HTTP client for one device
pub struct DeviceClient {
    http_client: reqwest::Client,
    target: DeviceTarget,
    base_url: String,
    settings: DeviceSettings,
}

impl DeviceClient {
    pub fn new(target: DeviceTarget, settings: DeviceSettings) -> Result<Self, DeviceError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| DeviceError::Transport(e.to_string()))?;

        let base_url = target.base_url();
        Ok(Self {
            http_client,
            target,
            base_url,
            settings,
        })
    }

    pub fn target(&self) -> &DeviceTarget {
        &self.target
    }

    /// Issue one request with retries; returns the reply body
    async fn call(
        &self,
        operation: &str,
        method: Method,
        path_and_query: &str,
        body: Option<Vec<u8>>,
    ) -> Result<String, DeviceError> {
        self.settings
            .retry
            .run(operation, || {
                self.call_once(method.clone(), path_and_query, body.clone())
            })
            .await
    }

    /// Challenge/response round: unauthenticated request, then the digest-signed request
    async fn call_once(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Vec<u8>>,
    ) -> Result<String, DeviceError> {
        let url = format!("{}{}", self.base_url, path_and_query);

        let first = self
            .build_request(method.clone(), &url, body.clone(), None)
            .send()
            .await
            .map_err(DeviceError::from_reqwest)?;

        let response = if first.status() == StatusCode::UNAUTHORIZED {
            let challenge = first
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(DigestChallenge::parse)
                .ok_or_else(|| {
                    DeviceError::Auth("401 without a digest challenge".to_string())
                })?;

            let authorization = challenge.authorization(
                &self.target.credentials,
                method.as_str(),
                path_and_query,
                &digest::new_cnonce(),
                1,
            );

            self.build_request(method, &url, body, Some(authorization))
                .send()
                .await
                .map_err(DeviceError::from_reqwest)?
        } else {
            first
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(DeviceError::Auth(format!(
                "credentials rejected for user {}",
                self.target.credentials.username
            )));
        }

        let text = response.text().await.map_err(DeviceError::from_reqwest)?;
        if !status.is_success() {
            return Err(DeviceError::Status(status.as_u16(), text.trim().to_string()));
        }

        Ok(text)
    }

    fn build_request(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        authorization: Option<String>,
    ) -> reqwest::RequestBuilder {
        let mut request = self.http_client.request(method, url);
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization);
        }
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }
        request
    }

    async fn post_json<T: Serialize>(
        &self,
        operation: &str,
        path_and_query: &str,
        payload: &T,
    ) -> Result<String, DeviceError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| DeviceError::Protocol(format!("encode {}: {}", operation, e)))?;
        self.call(operation, Method::POST, path_and_query, Some(body))
            .await
    }
}

#[async_trait]
impl DeviceApi for DeviceClient {
    fn address(&self) -> &str {
        &self.target.address
    }

    async fn find_enrolled(&self) -> Result<Vec<DeviceRecord>, DeviceError> {
        let path = format!(
            "/cgi-bin/recordFinder.cgi?action=doSeekFind&name=AccessControlCard&count={}",
            self.settings.max_records
        );

        let body = self.call("list enrolled", Method::GET, &path, None).await?;
        let records = parse_device_records(&body);
        tracing::debug!(
            device = %self.target.address,
            records = records.len(),
            "Listed enrolled identities"
        );
        Ok(records)
    }

    async fn delete_record(&self, remote_record_id: &str) -> Result<bool, DeviceError> {
        let path = format!(
            "/cgi-bin/recordUpdater.cgi?action=remove&name=AccessControlCard&RecNo={}",
            remote_record_id
        );
        let body = self.call("delete record", Method::GET, &path, None).await?;
        let ok = is_ok_reply(&body);
        if !ok {
            tracing::warn!(
                device = %self.target.address,
                record = %remote_record_id,
                reply = %body.trim(),
                "Device refused record deletion"
            );
        }
        Ok(ok)
    }

    async fn create_identities(&self, batch: &[Identity]) -> Result<ChunkOutcome, DeviceError> {
        if batch.len() > MAX_BATCH {
            return Err(DeviceError::InvalidBatch(batch.len()));
        }
        if batch.is_empty() {
            return Ok(ChunkOutcome::default());
        }

        let payload = UserListRequest {
            user_list: batch.iter().map(user_payload).collect(),
        };
        let body = self
            .post_json(
                "create identities",
                "/cgi-bin/AccessUser.cgi?action=insertMulti",
                &payload,
            )
            .await?;

        let outcome = ChunkOutcome::judged(batch.len(), is_ok_reply(&body));
        if !outcome.is_success() {
            tracing::warn!(
                device = %self.target.address,
                batch = batch.len(),
                reply = %body.trim(),
                "Identity chunk rejected"
            );
        }
        Ok(outcome)
    }

    async fn create_faces(&self, batch: &[FaceEnrollment]) -> Result<ChunkOutcome, DeviceError> {
        if batch.len() > MAX_BATCH {
            return Err(DeviceError::InvalidBatch(batch.len()));
        }
        if batch.is_empty() {
            return Ok(ChunkOutcome::default());
        }

        let payload = FaceListRequest {
            face_list: batch
                .iter()
                .map(|face| FacePayload {
                    user_id: face.identity_id.as_str(),
                    photo_data: [face.photo_base64.as_str()],
                })
                .collect(),
        };
        let body = self
            .post_json(
                "create faces",
                "/cgi-bin/AccessFace.cgi?action=insertMulti",
                &payload,
            )
            .await?;

        let outcome = ChunkOutcome::judged(batch.len(), is_ok_reply(&body));
        if !outcome.is_success() {
            tracing::warn!(
                device = %self.target.address,
                batch = batch.len(),
                reply = %body.trim(),
                "Face chunk rejected"
            );
        }
        Ok(outcome)
    }

    async fn settle(&self) {
        if !self.settings.settle_delay.is_zero() {
            tracing::debug!(
                device = %self.target.address,
                delay_ms = self.settings.settle_delay.as_millis() as u64,
                "Waiting for device state to settle"
            );
            tokio::time::sleep(self.settings.settle_delay).await;
        }
    }
}

/// Production factory building `DeviceClient`s with shared settings
pub struct HttpDeviceFactory {
    settings: DeviceSettings,
}

impl HttpDeviceFactory {
    pub fn new(settings: DeviceSettings) -> Self {
        Self { settings }
    }
}

impl DeviceApiFactory for HttpDeviceFactory {
    fn connect(&self, target: &DeviceTarget) -> Result<Arc<dyn DeviceApi>, DeviceError> {
        let client = DeviceClient::new(target.clone(), self.settings.clone())?;
        Ok(Arc::new(client))
    }
}
