//! Observability infrastructure for the workload driver
//!
//! Provides:
//! - A metrics port the driver reports through, with a Prometheus implementation
//! - Structured JSON logging of workload lifecycle events with tracing

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use tracing::{error, info, warn};

use crate::workload::WorkloadState;

/// Histogram buckets for tick durations (in seconds)
const TICK_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Histogram buckets for backend latencies (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Sink for driver metrics.
///
/// Every method defaults to a no-op so implementations only override what
/// they export.
pub trait MetricsPort: Send + Sync {
    fn observe_tick_duration(&self, _workload_id: &str, _secs: f64) {}

    fn inc_events_processed(&self, _workload_id: &str) {}

    fn inc_sessions_delayed(&self, _workload_id: &str) {}

    fn observe_training_start_latency(&self, _workload_id: &str, _secs: f64) {}

    fn set_active_sessions(&self, _workload_id: &str, _count: i64) {}

    fn set_active_trainings(&self, _workload_id: &str, _count: i64) {}

    fn record_state_transition(&self, _workload_id: &str, _state: WorkloadState) {}
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsPort for NoopMetrics {}

/// Prometheus-backed metrics, registered on a caller-supplied registry
#[derive(Clone)]
pub struct PrometheusMetrics {
    tick_duration_seconds: HistogramVec,
    events_processed: IntCounterVec,
    sessions_delayed: IntCounterVec,
    training_start_latency_seconds: HistogramVec,
    active_sessions: IntGaugeVec,
    active_trainings: IntGaugeVec,
    state_transitions: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let tick_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "workload_driver_tick_duration_seconds",
                "Wall-clock time spent issuing and pacing one logical tick",
            )
            .buckets(TICK_BUCKETS.to_vec()),
            &["workload_id"],
        )?;
        let events_processed = IntCounterVec::new(
            Opts::new(
                "workload_driver_events_processed_total",
                "Events handled by session clients",
            ),
            &["workload_id"],
        )?;
        let sessions_delayed = IntCounterVec::new(
            Opts::new(
                "workload_driver_sessions_delayed_total",
                "Times a session was delayed by resource contention",
            ),
            &["workload_id"],
        )?;
        let training_start_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "workload_driver_training_start_latency_seconds",
                "Time from code submission until the backend reports training started",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["workload_id"],
        )?;
        let active_sessions = IntGaugeVec::new(
            Opts::new("workload_driver_active_sessions", "Sessions currently alive"),
            &["workload_id"],
        )?;
        let active_trainings = IntGaugeVec::new(
            Opts::new(
                "workload_driver_active_trainings",
                "Trainings currently executing",
            ),
            &["workload_id"],
        )?;
        let state_transitions = IntCounterVec::new(
            Opts::new(
                "workload_driver_state_transitions_total",
                "Workload lifecycle transitions by target state",
            ),
            &["workload_id", "state"],
        )?;

        registry.register(Box::new(tick_duration_seconds.clone()))?;
        registry.register(Box::new(events_processed.clone()))?;
        registry.register(Box::new(sessions_delayed.clone()))?;
        registry.register(Box::new(training_start_latency_seconds.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(active_trainings.clone()))?;
        registry.register(Box::new(state_transitions.clone()))?;

        Ok(Self {
            tick_duration_seconds,
            events_processed,
            sessions_delayed,
            training_start_latency_seconds,
            active_sessions,
            active_trainings,
            state_transitions,
        })
    }
}

impl MetricsPort for PrometheusMetrics {
    fn observe_tick_duration(&self, workload_id: &str, secs: f64) {
        self.tick_duration_seconds
            .with_label_values(&[workload_id])
            .observe(secs);
    }

    fn inc_events_processed(&self, workload_id: &str) {
        self.events_processed.with_label_values(&[workload_id]).inc();
    }

    fn inc_sessions_delayed(&self, workload_id: &str) {
        self.sessions_delayed.with_label_values(&[workload_id]).inc();
    }

    fn observe_training_start_latency(&self, workload_id: &str, secs: f64) {
        self.training_start_latency_seconds
            .with_label_values(&[workload_id])
            .observe(secs);
    }

    fn set_active_sessions(&self, workload_id: &str, count: i64) {
        self.active_sessions.with_label_values(&[workload_id]).set(count);
    }

    fn set_active_trainings(&self, workload_id: &str, count: i64) {
        self.active_trainings
            .with_label_values(&[workload_id])
            .set(count);
    }

    fn record_state_transition(&self, workload_id: &str, state: WorkloadState) {
        self.state_transitions
            .with_label_values(&[workload_id, state.as_str()])
            .inc();
    }
}

/// Structured logger for workload lifecycle events
///
/// Provides consistent JSON-formatted logging so runs can be reconstructed
/// from the log stream alone.
#[derive(Clone)]
pub struct StructuredLogger {
    workload_id: String,
}

impl StructuredLogger {
    pub fn new(workload_id: impl Into<String>) -> Self {
        Self {
            workload_id: workload_id.into(),
        }
    }

    pub fn log_registered(&self, name: &str, kind: &str, total_sessions: usize) {
        info!(
            event = "workload_registered",
            workload_id = %self.workload_id,
            workload_name = %name,
            kind = %kind,
            total_sessions = total_sessions,
            "Workload registered"
        );
    }

    pub fn log_started(&self, tick_duration_ms: i64, timescale_adjustment_factor: f64) {
        info!(
            event = "workload_started",
            workload_id = %self.workload_id,
            tick_duration_ms = tick_duration_ms,
            timescale_adjustment_factor = timescale_adjustment_factor,
            "Workload started"
        );
    }

    pub fn log_paused(&self, tick: &str) {
        info!(
            event = "workload_paused",
            workload_id = %self.workload_id,
            tick = %tick,
            "Workload paused"
        );
    }

    pub fn log_unpaused(&self, paused_ms: u64) {
        info!(
            event = "workload_unpaused",
            workload_id = %self.workload_id,
            time_spent_paused_ms = paused_ms,
            "Workload resumed"
        );
    }

    pub fn log_finished(&self, total_ticks: u64, events_processed: u64, duration_ms: u64) {
        info!(
            event = "workload_finished",
            workload_id = %self.workload_id,
            total_ticks = total_ticks,
            events_processed = events_processed,
            duration_ms = duration_ms,
            "Workload finished"
        );
    }

    pub fn log_stopped(&self, reason: &str) {
        warn!(
            event = "workload_stopped",
            workload_id = %self.workload_id,
            reason = %reason,
            "Workload stopped before completion"
        );
    }

    pub fn log_erred(&self, error_message: &str) {
        error!(
            event = "workload_erred",
            workload_id = %self.workload_id,
            error = %error_message,
            "Workload aborted by critical error"
        );
    }
}
