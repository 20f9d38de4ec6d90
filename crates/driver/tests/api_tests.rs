//! Integration tests for the workload driver API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use driver_lib::{
    health::{components, HealthRegistry},
    kernel::{SimulatedKernel, SimulatedKernelConfig},
    DriverConfig, PrometheusMetrics, WorkloadManager,
};
use prometheus::Registry;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use workload_driver::api::{create_router, AppState};

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::MANAGER);
    health_registry.register(components::KERNEL);

    let registry = Registry::new();
    let metrics = PrometheusMetrics::new(&registry).unwrap();
    let kernel = Arc::new(SimulatedKernel::new(SimulatedKernelConfig {
        create_latency: Duration::ZERO,
        capacity: None,
    }));
    let manager = Arc::new(
        WorkloadManager::new(kernel, DriverConfig::default()).with_metrics(Arc::new(metrics)),
    );

    let state = Arc::new(AppState::new(health_registry, manager, registry));
    let router = create_router(state.clone());

    (router, state)
}

fn template_body() -> Value {
    json!({
        "name": "api workload",
        "seed": 3,
        "sessions": [{
            "id": "s1",
            "start_tick": 0,
            "stop_tick": 4,
            "max_resource_request": {"millicpus": 1000.0, "memory_mb": 2048.0, "gpus": 1, "vram_gb": 4.0},
            "trainings": [{
                "index": 0,
                "millicpus": 500.0,
                "mem_mb": 1024.0,
                "vram_gb": 2.0,
                "gpu_utilizations": [75.0],
                "start_tick": 1,
                "duration_in_ticks": 2
            }]
        }]
    })
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = send(&app, "GET", "/healthz", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["manager"].is_object());
    assert!(health["components"]["kernel"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::KERNEL, "Backend unreachable");

    let (status, health) = send(&app, "GET", "/healthz", None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_ready_flag() {
    let (app, state) = setup_test_app().await;

    let (status, readiness) = send(&app, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    state.health_registry.set_ready(true);
    let (status, readiness) = send(&app, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_register_and_fetch_workload() {
    let (app, _state) = setup_test_app().await;

    let (status, created) = send(&app, "POST", "/api/v1/workloads", Some(template_body())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["id"], "workload-0");
    assert_eq!(created["state"], "ready");
    assert_eq!(created["kind"], "template");
    assert_eq!(created["statistics"]["total_num_sessions"], 1);

    let (status, fetched) = send(&app, "GET", "/api/v1/workloads/workload-0", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], "api workload");

    let (status, listed) = send(&app, "GET", "/api/v1/workloads", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_template_is_bad_request() {
    let (app, _state) = setup_test_app().await;

    let mut body = template_body();
    body["sessions"][0]["stop_tick"] = json!(2);

    let (status, error) = send(&app, "POST", "/api/v1/workloads", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error["error"].as_str().unwrap().contains("invalid workload template"));
}

#[tokio::test]
async fn test_out_of_range_ticks_are_bad_request() {
    let (app, _state) = setup_test_app().await;

    let mut far = template_body();
    far["sessions"][0]["start_tick"] = json!(i32::MAX as u64 + 10);
    far["sessions"][0]["stop_tick"] = json!(i32::MAX as u64 + 20);
    far["sessions"][0]["trainings"] = json!([]);
    let (status, _) = send(&app, "POST", "/api/v1/workloads", Some(far)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut endless = template_body();
    endless["sessions"][0]["trainings"][0]["duration_in_ticks"] = json!(u64::MAX);
    let (status, _) = send(&app, "POST", "/api/v1/workloads", Some(endless)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, listed) = send(&app, "GET", "/api/v1/workloads", None).await;
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_workload_is_not_found() {
    let (app, _state) = setup_test_app().await;

    let (status, error) = send(&app, "GET", "/api/v1/workloads/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["error"], "unknown workload: missing");

    let (status, _) = send(&app, "POST", "/api/v1/workloads/missing/start", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_workload_lifecycle_over_http() {
    let (app, _state) = setup_test_app().await;
    send(&app, "POST", "/api/v1/workloads", Some(template_body())).await;

    let (status, started) = send(&app, "POST", "/api/v1/workloads/workload-0/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(started["state"], "running");

    let (status, _) = send(&app, "POST", "/api/v1/workloads/workload-0/start", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, paused) = send(&app, "POST", "/api/v1/workloads/workload-0/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paused["state"], "pausing");

    let (status, _) = send(&app, "POST", "/api/v1/workloads/workload-0/pause", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, resumed) = send(&app, "POST", "/api/v1/workloads/workload-0/unpause", None).await;
    assert_eq!(status, StatusCode::OK);
    // the tick loop may already have parked the workload, in which case it
    // resumes on its own once it wakes
    assert!(resumed["state"] == "running" || resumed["state"] == "paused");

    let (status, stopped) = send(&app, "POST", "/api/v1/workloads/workload-0/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["state"], "terminated");

    let (status, _) = send(&app, "POST", "/api/v1/workloads/workload-0/stop", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, _state) = setup_test_app().await;
    send(&app, "POST", "/api/v1/workloads", Some(template_body())).await;
    send(&app, "POST", "/api/v1/workloads/workload-0/start", None).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("workload_driver_state_transitions_total"));
    assert!(metrics_text.contains("state=\"running\""));
}
