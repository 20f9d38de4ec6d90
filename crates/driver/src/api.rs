//! HTTP API for health checks, Prometheus metrics and workload control

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use driver_lib::{
    health::{ComponentStatus, HealthRegistry},
    DriverError, ManagerError, TemplateRegistration, WorkloadError, WorkloadManager,
    WorkloadSnapshot,
};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub manager: Arc<WorkloadManager>,
    pub registry: Registry,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        manager: Arc<WorkloadManager>,
        registry: Registry,
    ) -> Self {
        Self {
            health_registry,
            manager,
            registry,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorBody>)>;

fn status_for(err: &ManagerError) -> StatusCode {
    match err {
        ManagerError::UnknownWorkload(_) => StatusCode::NOT_FOUND,
        ManagerError::DuplicateWorkload(_) => StatusCode::CONFLICT,
        ManagerError::Workload(WorkloadError::InvalidTemplate(_)) => StatusCode::BAD_REQUEST,
        ManagerError::Workload(_) => StatusCode::CONFLICT,
        ManagerError::Driver(DriverError::Workload(_) | DriverError::AlreadyStarted) => {
            StatusCode::CONFLICT
        }
        ManagerError::Driver(DriverError::MissingComponent(_)) => StatusCode::BAD_REQUEST,
        ManagerError::Driver(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: ManagerError) -> (StatusCode, Json<ErrorBody>) {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, "Workload request failed");
    }
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
}

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health();

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness();

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

async fn list_workloads(State(state): State<Arc<AppState>>) -> Json<Vec<WorkloadSnapshot>> {
    Json(state.manager.list())
}

async fn get_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<WorkloadSnapshot> {
    state.manager.snapshot(&id).map(Json).map_err(error_response)
}

async fn register_workload(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<TemplateRegistration>,
) -> Result<(StatusCode, Json<WorkloadSnapshot>), (StatusCode, Json<ErrorBody>)> {
    let driver = state
        .manager
        .register_template(registration)
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(driver.workload().snapshot())))
}

async fn start_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<WorkloadSnapshot> {
    state.manager.start(&id).map(Json).map_err(error_response)
}

async fn pause_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<WorkloadSnapshot> {
    state.manager.pause(&id).map(Json).map_err(error_response)
}

async fn unpause_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<WorkloadSnapshot> {
    state.manager.unpause(&id).map(Json).map_err(error_response)
}

async fn stop_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<WorkloadSnapshot> {
    state.manager.stop(&id).map(Json).map_err(error_response)
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route(
            "/api/v1/workloads",
            get(list_workloads).post(register_workload),
        )
        .route("/api/v1/workloads/:id", get(get_workload))
        .route("/api/v1/workloads/:id/start", post(start_workload))
        .route("/api/v1/workloads/:id/pause", post(pause_workload))
        .route("/api/v1/workloads/:id/unpause", post(unpause_workload))
        .route("/api/v1/workloads/:id/stop", post(stop_workload))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
