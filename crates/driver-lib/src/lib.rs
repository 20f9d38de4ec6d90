//! Discrete-event workload driving engine
//!
//! This crate provides the core functionality for:
//! - Logical clocks and synchronous tick delivery
//! - A per-session event queue with holds and delays
//! - Workload lifecycle, sampling and statistics
//! - The workload driver and its per-session clients
//! - Health checks and observability

pub mod clock;
pub mod driver;
pub mod error;
pub mod event_queue;
pub mod generator;
pub mod health;
pub mod kernel;
pub mod manager;
pub mod models;
pub mod observability;
pub mod workload;

pub use driver::{DriverConfig, ErrorHandler, ErrorHandlers, WorkloadDriver, WorkloadDriverBuilder};
pub use error::{
    ClockError, DriverError, KernelError, ManagerError, QueueError, TickerClosed, WorkloadError,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use manager::{TemplateRegistration, WorkloadManager};
pub use models::*;
pub use observability::{MetricsPort, NoopMetrics, PrometheusMetrics, StructuredLogger};
pub use workload::{Statistics, Workload, WorkloadKind, WorkloadSnapshot, WorkloadState};
