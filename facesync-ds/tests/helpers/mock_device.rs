//! In-process stand-in for an access-control terminal
//!
//! Speaks the enrollment CGI endpoints behind HTTP digest auth (qop=auth, MD5)
//! and also serves face photos under `/photos/` without auth, so one mock can
//! back both the photo download and the device side of a sync cycle.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "s3cret";
const REALM: &str = "Login to FST-TERMINAL";

/// Counters of authenticated calls per endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list: usize,
    pub delete: usize,
    pub identity_chunks: usize,
    pub face_chunks: usize,
    pub rejected_auth: usize,
}

#[derive(Default)]
pub struct DeviceState {
    password: String,
    /// RecNo → (UserID, CardName)
    records: BTreeMap<u32, (String, String)>,
    next_rec: u32,
    faces: BTreeSet<String>,
    /// Acknowledged with OK but never stored
    dropped_users: HashSet<String>,
    reject_identity_chunks: bool,
    photos: HashMap<String, Vec<u8>>,
    slow_photos: HashSet<String>,
    nonce_seq: u64,
    calls: CallCounts,
}

type Shared = Arc<Mutex<DeviceState>>;

pub struct MockDevice {
    addr: SocketAddr,
    state: Shared,
}

impl MockDevice {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(DeviceState {
            password: PASSWORD.to_string(),
            next_rec: 1,
            ..Default::default()
        }));

        let app = Router::new().fallback(handle).with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// Device address as written in config (`127.0.0.1:port`)
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn photo_url(&self, name: &str) -> String {
        format!("http://{}/photos/{}", self.addr, name)
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    pub fn set_password(&self, password: &str) {
        self.state().password = password.to_string();
    }

    /// Pre-existing enrollment; returns its RecNo
    pub fn enroll(&self, user_id: &str, name: &str) -> u32 {
        let mut state = self.state();
        let rec_no = state.next_rec;
        state.next_rec += 1;
        state
            .records
            .insert(rec_no, (user_id.to_string(), name.to_string()));
        rec_no
    }

    pub fn drop_users(&self, user_ids: &[&str]) {
        let mut state = self.state();
        state.dropped_users = user_ids.iter().map(|id| id.to_string()).collect();
    }

    pub fn reject_identity_chunks(&self, reject: bool) {
        self.state().reject_identity_chunks = reject;
    }

    pub fn add_photo(&self, name: &str, bytes: Vec<u8>) {
        self.state().photos.insert(name.to_string(), bytes);
    }

    /// Photo that never finishes downloading within a test timeout
    pub fn add_slow_photo(&self, name: &str) {
        self.state().slow_photos.insert(name.to_string());
    }

    pub fn enrolled_ids(&self) -> BTreeSet<String> {
        self.state()
            .records
            .values()
            .map(|(user_id, _)| user_id.clone())
            .collect()
    }

    pub fn faces(&self) -> BTreeSet<String> {
        self.state().faces.clone()
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }
}

async fn handle(
    State(state): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(name) = uri.path().strip_prefix("/photos/") {
        return serve_photo(&state, name).await;
    }

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();

    let mut device = state.lock().unwrap();
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|auth| digest_valid(auth, &method, &path_and_query, &device.password));

    if !authorized {
        if headers.contains_key(header::AUTHORIZATION) {
            device.calls.rejected_auth += 1;
        }
        device.nonce_seq += 1;
        let challenge = format!(
            "Digest realm=\"{}\", qop=\"auth\", nonce=\"{:032x}\", opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"",
            REALM, device.nonce_seq
        );
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, challenge)],
            String::new(),
        )
            .into_response();
    }

    let query = query_params(uri.query().unwrap_or_default());
    match uri.path() {
        "/cgi-bin/recordFinder.cgi" => {
            device.calls.list += 1;
            list_records(&device).into_response()
        }
        "/cgi-bin/recordUpdater.cgi" => {
            device.calls.delete += 1;
            let removed = query
                .get("RecNo")
                .and_then(|rec| rec.parse::<u32>().ok())
                .and_then(|rec| device.records.remove(&rec));
            match removed {
                Some((user_id, _)) => {
                    device.faces.remove(&user_id);
                    "OK".into_response()
                }
                None => "Error".into_response(),
            }
        }
        "/cgi-bin/AccessUser.cgi" => {
            device.calls.identity_chunks += 1;
            if device.reject_identity_chunks {
                return "Error".into_response();
            }
            let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
                return (StatusCode::BAD_REQUEST, "Error").into_response();
            };
            for user in payload["UserList"].as_array().into_iter().flatten() {
                let user_id = user["UserID"].as_str().unwrap_or_default().to_string();
                let name = user["UserName"].as_str().unwrap_or_default().to_string();
                if device.dropped_users.contains(&user_id) {
                    continue;
                }
                let rec_no = device.next_rec;
                device.next_rec += 1;
                device.records.insert(rec_no, (user_id, name));
            }
            "OK".into_response()
        }
        "/cgi-bin/AccessFace.cgi" => {
            device.calls.face_chunks += 1;
            let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
                return (StatusCode::BAD_REQUEST, "Error").into_response();
            };
            for face in payload["FaceList"].as_array().into_iter().flatten() {
                if let Some(user_id) = face["UserID"].as_str() {
                    device.faces.insert(user_id.to_string());
                }
            }
            "OK".into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_photo(state: &Shared, name: &str) -> Response {
    let (bytes, slow) = {
        let device = state.lock().unwrap();
        (
            device.photos.get(name).cloned(),
            device.slow_photos.contains(name),
        )
    };
    if slow {
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
    match bytes {
        Some(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn list_records(device: &DeviceState) -> String {
    let mut body = format!("found={}\r\n", device.records.len());
    for (index, (rec_no, (user_id, name))) in device.records.iter().enumerate() {
        body.push_str(&format!("records[{}].RecNo={}\r\n", index, rec_no));
        body.push_str(&format!("records[{}].UserID={}\r\n", index, user_id));
        body.push_str(&format!("records[{}].CardName={}\r\n", index, name));
    }
    body
}

fn query_params(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Server-side check of a qop=auth digest response
fn digest_valid(header_value: &str, method: &Method, path_and_query: &str, password: &str) -> bool {
    let Some(rest) = header_value.strip_prefix("Digest ") else {
        return false;
    };
    let params: HashMap<&str, &str> = rest
        .split(", ")
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim().trim_matches('"')))
        .collect();

    let field = |name: &str| params.get(name).copied().unwrap_or_default();
    if field("username") != USERNAME || field("realm") != REALM || field("uri") != path_and_query {
        return false;
    }

    let ha1 = md5_hex(&format!("{}:{}:{}", USERNAME, REALM, password));
    let ha2 = md5_hex(&format!("{}:{}", method.as_str(), path_and_query));
    let expected = md5_hex(&format!(
        "{}:{}:{}:{}:{}:{}",
        ha1,
        field("nonce"),
        field("nc"),
        field("cnonce"),
        field("qop"),
        ha2
    ));
    field("response") == expected
}
