//! HTTP request-surface tests exercising the axum router end to end with
//! `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use syncd::adapters::LoggingAdapterLink;
use syncd::config::AppConfig;
use syncd::facade::{self, Scheduler};
use syncd::models::account::LocalAccounts;
use syncd::server::{create_app, AppState};

struct TestApp {
    app: Router,
    scheduler: Scheduler,
    _dir: tempfile::TempDir,
}

fn setup() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(AppConfig {
        data_dir: dir.path().to_path_buf(),
        ..AppConfig::default()
    });
    let scheduler = facade::start(
        config.clone(),
        Arc::new(LocalAccounts),
        Arc::new(LoggingAdapterLink),
    )
    .expect("start scheduler");
    let app = create_app(AppState {
        handle: scheduler.handle(),
        config,
    });
    TestApp {
        app,
        scheduler,
        _dir: dir,
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_and_root_respond() {
    let test = setup();

    let (status, body) = send(&test.app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "syncd");

    let (status, body) = send(&test.app, "GET", "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "syncd");

    test.scheduler.shutdown().await;
}

#[tokio::test]
async fn job_lifecycle_over_http() {
    let test = setup();

    let (status, _) = send(
        &test.app,
        "POST",
        "/adapters",
        Some(json!({"package_id": "pkg.a", "service_app_id": "app.a"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &test.app,
        "POST",
        "/jobs/on-demand",
        Some(json!({"package_id": "pkg.a", "job_name": "n1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sync_job_id"], 1);

    let (status, body) = send(&test.app, "GET", "/jobs?package_id=pkg.a", None).await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["job_name"], "n1");
    assert_eq!(jobs[0]["account_id"], -1);

    let (status, _) = send(
        &test.app,
        "DELETE",
        "/jobs/1?package_id=pkg.a",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&test.app, "GET", "/jobs?package_id=pkg.a", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());

    test.scheduler.shutdown().await;
}

#[tokio::test]
async fn periodic_accepts_interval_tags() {
    let test = setup();

    send(
        &test.app,
        "POST",
        "/adapters",
        Some(json!({"package_id": "pkg.a", "service_app_id": "app.a"})),
    )
    .await;

    let (status, body) = send(
        &test.app,
        "POST",
        "/jobs/periodic",
        Some(json!({"package_id": "pkg.a", "job_name": "poll", "interval": "30min"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sync_job_id"], 1);

    let all = test
        .scheduler
        .repository()
        .get_copy_of_all_capabilities_and_status();
    assert_eq!(all[0].0.periodic_syncs[0].period_sec, 1800);

    // A request without interval or period is malformed.
    let (status, body) = send(
        &test.app,
        "POST",
        "/jobs/periodic",
        Some(json!({"package_id": "pkg.a", "job_name": "p2"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PARAMETER");

    test.scheduler.shutdown().await;
}

#[tokio::test]
async fn error_mapping_follows_the_taxonomy() {
    let test = setup();

    // No adapter registered yet.
    let (status, body) = send(
        &test.app,
        "POST",
        "/jobs/on-demand",
        Some(json!({"package_id": "pkg.missing", "job_name": "n"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "SYNC_ADAPTER_NOT_FOUND");

    send(
        &test.app,
        "POST",
        "/adapters",
        Some(json!({"package_id": "pkg.a", "service_app_id": "app.a"})),
    )
    .await;

    // Unknown data-change capability.
    let (status, body) = send(
        &test.app,
        "POST",
        "/jobs/data-change",
        Some(json!({"package_id": "pkg.a", "capability": "not-a-capability"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PARAMETER");

    // Job id out of range.
    let (status, body) = send(&test.app, "DELETE", "/jobs/101?package_id=pkg.a", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PARAMETER");

    // Unregister before register.
    let (status, body) = send(&test.app, "DELETE", "/adapters/pkg.other", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_OPERATION");

    test.scheduler.shutdown().await;
}

#[tokio::test]
async fn signals_are_accepted_and_validated() {
    let test = setup();

    let (status, _) = send(
        &test.app,
        "POST",
        "/signals/network",
        Some(json!({"medium": "wifi", "connected": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &test.app,
        "POST",
        "/signals/storage",
        Some(json!({"level": "soft_warning"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &test.app,
        "POST",
        "/signals/media",
        Some(json!({"media_type": "image"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &test.app,
        "POST",
        "/signals/data-change",
        Some(json!({"capability": "bogus"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PARAMETER");

    test.scheduler.shutdown().await;
}

#[tokio::test]
async fn sync_status_toggle_round_trips() {
    let test = setup();

    let (status, body) = send(
        &test.app,
        "PUT",
        "/sync-status",
        Some(json!({"enabled": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _) = send(
        &test.app,
        "PUT",
        "/sync-status",
        Some(json!({"enabled": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    test.scheduler.shutdown().await;
}
