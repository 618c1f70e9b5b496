//! HTTP tests for the health and queue administration endpoints.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use meetsync_jobs::{JobData, JobOptions, JobsConfig, QueueRuntime};
use meetsync_server::{create_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt; // For oneshot()

fn app() -> (Router, Arc<QueueRuntime>) {
    let runtime = Arc::new(QueueRuntime::in_memory(JobsConfig::default()));
    (create_router(AppState::new(runtime.clone())), runtime)
}

async fn json_body(body: Body) -> Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_probes() {
    let (app, _) = app();

    let response = app.clone().oneshot(get("/live")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response.into_body()).await["status"], "healthy");

    let response = app.oneshot(get("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response.into_body()).await;
    assert_eq!(body["ready"], true);
    assert_eq!(body["backend"], "memory");
}

#[tokio::test]
async fn test_not_ready_when_backend_disabled() {
    let config = JobsConfig {
        redis: meetsync_jobs::RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connect_timeout_secs: 1,
            ..Default::default()
        },
        ..JobsConfig::default()
    };
    let runtime = Arc::new(QueueRuntime::connect(config).await);
    let app = create_router(AppState::new(runtime));

    let response = app.clone().oneshot(get("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(json_body(response.into_body()).await["degraded"].is_string());

    // Reads degrade to empty counts rather than failing.
    let response = app.oneshot(get("/api/v1/queues/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_system_health_reports_waiting_without_workers() {
    let (app, runtime) = app();
    runtime
        .email()
        .unwrap()
        .send_verification_email("a@x.com", "123456")
        .await
        .unwrap();

    let response = app.oneshot(get("/api/v1/queues/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response.into_body()).await;
    let data = &body["data"];
    assert_eq!(data["healthy"], false);
    assert_eq!(data["totals"]["waiting"], 1);
    assert_eq!(data["queues"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_queue_health_and_unknown_queue() {
    let (app, _) = app();

    let response = app.clone().oneshot(get("/api/v1/queues/meeting/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response.into_body()).await["data"]["healthy"], true);

    let response = app.oneshot(get("/api/v1/queues/nope/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response.into_body()).await["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_job_details() {
    let (app, runtime) = app();
    runtime
        .queue("meeting")
        .unwrap()
        .add_job(
            "sync_record",
            JobData::new("meeting-m1-sync_record", json!({ "meetingId": "m1" })).unwrap(),
            JobOptions::new(),
        )
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(get("/api/v1/queues/meeting/jobs/meeting-m1-sync_record"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response.into_body()).await;
    assert_eq!(body["data"]["state"], "waiting");
    assert_eq!(body["data"]["max_attempts"], 3);

    let response = app.oneshot(get("/api/v1/queues/meeting/jobs/missing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_pause_resume_and_clean() {
    let (app, runtime) = app();

    let response = app.clone().oneshot(post("/api/v1/queues/pause", json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(runtime.queue("email").unwrap().is_paused().await);

    let response = app.clone().oneshot(post("/api/v1/queues/resume", json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!runtime.queue("external-api").unwrap().is_paused().await);

    let response = app
        .oneshot(post("/api/v1/queues/clean", json!({ "completed_max_age_secs": 0 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response.into_body()).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_metrics_endpoint_without_recorder() {
    let (app, _) = app();

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&bytes).contains("Metrics not initialized"));
}
