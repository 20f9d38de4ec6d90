//! Workload driver service
//!
//! Runs template workloads against the in-process simulated kernel and
//! exposes health, metrics and workload control over HTTP.

use anyhow::{Context, Result};
use driver_lib::{
    health::{components, HealthRegistry},
    kernel::SimulatedKernel,
    DriverError, ErrorHandlers, PrometheusMetrics, WorkloadManager, WorkloadSnapshot,
};
use prometheus::Registry;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use workload_driver::{
    api,
    config::{load_template, ServiceConfig},
};

const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = SERVICE_VERSION, "Starting workload-driver");

    let config = ServiceConfig::load()?;
    info!(
        api_port = config.api_port,
        tick_duration_secs = config.tick_duration_secs,
        timescale_adjustment_factor = config.timescale_adjustment_factor,
        "Service configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::MANAGER);
    health_registry.register(components::KERNEL);
    health_registry.register(components::PUSH_LOOP);

    let registry = Registry::new();
    let metrics =
        PrometheusMetrics::new(&registry).context("failed to register driver metrics")?;

    let kernel = Arc::new(SimulatedKernel::new(config.simulated_kernel_config()));
    let manager = Arc::new(
        WorkloadManager::new(kernel, config.driver_config())
            .with_metrics(Arc::new(metrics))
            .with_error_handlers(error_handlers(health_registry.clone()))
            .with_sessions_sample_percentage(config.sessions_sample_percentage),
    );

    if let Some(path) = &config.template_path {
        let registration = load_template(path)?;
        let driver = manager
            .register_template(registration)
            .context("failed to register startup template")?;
        info!(workload_id = %driver.workload().id(), path = %path, "Registered startup template");
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let push_handle = manager.spawn_push_loop(config.push_interval(), shutdown_tx.subscribe());
    tokio::spawn(watch_snapshots(
        manager.subscribe(),
        health_registry.clone(),
        shutdown_tx.subscribe(),
    ));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        Arc::clone(&manager),
        registry,
    ));

    health_registry.set_ready(true);

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("SIGINT received");
        }
        result = api_handle => {
            match result {
                Ok(Ok(())) => warn!("API server exited"),
                Ok(Err(e)) => warn!(error = %e, "API server failed"),
                Err(e) => warn!(error = %e, "API server task panicked"),
            }
        }
    }

    info!("Shutting down");
    health_registry.set_ready(false);
    for snapshot in manager.list() {
        if snapshot.state.is_in_progress() {
            if let Err(e) = manager.stop(&snapshot.id) {
                warn!(workload_id = %snapshot.id, error = %e, "Failed to stop workload");
            }
        }
    }
    let _ = shutdown_tx.send(());
    let _ = push_handle.await;

    Ok(())
}

/// Log critical errors and fold kernel failures into service health
fn error_handlers(health_registry: HealthRegistry) -> ErrorHandlers {
    ErrorHandlers {
        on_critical: Arc::new(move |workload_id: &str, err: DriverError| {
            error!(workload_id = %workload_id, error = %err, "Workload aborted");
            health_registry.observe_critical_error(workload_id, &err);
        }),
        ..ErrorHandlers::default()
    }
}

/// Track each published batch of snapshots in the health registry
async fn watch_snapshots(
    mut snapshots: broadcast::Receiver<Vec<WorkloadSnapshot>>,
    health_registry: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            batch = snapshots.recv() => match batch {
                Ok(batch) => {
                    let active = batch.iter().filter(|s| s.state.is_in_progress()).count();
                    debug!(workloads = batch.len(), active, "Published workload snapshots");
                    health_registry.observe_workloads(&batch);
                    health_registry.set_healthy(components::PUSH_LOOP);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Snapshot watcher lagged");
                    health_registry.set_degraded(
                        components::PUSH_LOOP,
                        format!("skipped {} snapshot batches", skipped),
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.recv() => break,
        }
    }
}
