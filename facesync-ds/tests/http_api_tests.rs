//! Status API routing tests

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use facesync_ds::scheduler::{RunLock, Scheduler, SyncPipeline};
use facesync_ds::services::registry::{DeviceRegistry, RegistryRecord};
use facesync_ds::{build_router, AppState};

use helpers::{png_bytes, roster_entry, sync_config, write_roster, MockDevice, PASSWORD};

fn test_registry(dir: &std::path::Path) -> Arc<DeviceRegistry> {
    Arc::new(DeviceRegistry::new(dir.join("registry"), dir.join("backups")))
}

async fn get_json(state: AppState, uri: &str) -> (StatusCode, Value) {
    let response = build_router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_health_reports_module_and_version() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::new(test_registry(dir.path()), None);

    let (status, body) = get_json(state, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "facesync-ds");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert!(body["build"].is_string());
    assert_eq!(body["build_timestamp"], env!("BUILD_TIMESTAMP"));
    assert!(["debug", "release"].contains(&body["build_profile"].as_str().unwrap()));
    assert!(body.get("last_error").is_none());
}

#[tokio::test]
async fn test_status_without_scheduler_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::new(test_registry(dir.path()), None);

    let (status, body) = get_json(state.clone(), "/status").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _) = get_json(state, "/photos/stats").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_registry_routes() {
    let dir = tempfile::tempdir().unwrap();
    let registry = test_registry(dir.path());
    let identity = roster_entry(1, None).identity;
    registry
        .upsert(
            "10.0.0.5",
            &identity.invite_id,
            RegistryRecord::from_identity(&identity, true),
        )
        .await
        .unwrap();
    let state = AppState::new(Arc::clone(&registry), None);

    let (status, body) = get_json(state.clone(), "/registry/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["devices"], 1);
    assert_eq!(body["total_entries"], 1);

    let (status, body) = get_json(state.clone(), "/registry/10.0.0.5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["inviteId"], "inv-1");

    let (status, body) = get_json(state, "/registry/10.0.0.99").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_status_after_one_cycle() {
    let gate = MockDevice::start().await;
    gate.add_photo("p-1.png", png_bytes(80, 100));

    let dir = tempfile::tempdir().unwrap();
    let roster_path = dir.path().join("roster.json");
    write_roster(&roster_path, &[roster_entry(1, Some(gate.photo_url("p-1.png")))]);

    let config = sync_config(&roster_path, &[gate.address()], PASSWORD);
    let layout = facesync_common::config::RootLayout::new(dir.path().join("root"));
    layout.ensure_directories().unwrap();
    let registry = facesync_ds::scheduler::pipeline::build_registry(&config, &layout).unwrap();
    let pipeline = SyncPipeline::from_config(&config, &layout, Arc::clone(&registry)).unwrap();
    let photo_cache = pipeline.photo_cache();
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(pipeline),
        RunLock::new(layout.lock_path()),
        Duration::from_secs(300),
    ));

    assert!(scheduler.run_once().await.ran());

    let state = AppState::new(registry, Some(scheduler)).with_photo_cache(photo_cache);
    let (status, body) = get_json(state.clone(), "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], false);
    assert_eq!(body["cycles_run"], 1);
    assert_eq!(body["last_report"]["success"], true);
    assert_eq!(body["last_report"]["totals"]["registered"], 1);

    let (status, body) = get_json(state.clone(), "/photos/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["photos"], 1);
    assert!(body["total_bytes"].as_u64().unwrap() > 0);

    let (_, body) = get_json(state, "/health").await;
    assert_eq!(body["status"], "ok");
}
