//! Service health for `/healthz` and `/readyz`
//!
//! Components report into a [`HealthRegistry`]. Besides explicit updates,
//! the registry derives the manager's health from published workload
//! snapshots and the kernel's health from critical driver errors.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::DriverError;
use crate::workload::{WorkloadSnapshot, WorkloadState};

/// Component names for health tracking
pub mod components {
    pub const MANAGER: &str = "manager";
    pub const KERNEL: &str = "kernel";
    pub const PUSH_LOOP: &str = "push_loop";
}

/// Health of one component, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still serving, with problems worth a look
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst status across all components
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shared, cheaply cloneable health state
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
    ready: Arc<AtomicBool>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a component, starting out healthy
    pub fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy());
    }

    pub fn update(&self, name: &str, health: ComponentHealth) {
        self.components.write().insert(name.to_string(), health);
    }

    pub fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy());
    }

    pub fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message));
    }

    pub fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message));
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// The manager is degraded while any registered workload has erred
    pub fn observe_workloads(&self, snapshots: &[WorkloadSnapshot]) {
        let erred: Vec<&str> = snapshots
            .iter()
            .filter(|s| s.state == WorkloadState::Erred)
            .map(|s| s.id.as_str())
            .collect();

        if erred.is_empty() {
            self.set_healthy(components::MANAGER);
        } else {
            self.set_degraded(
                components::MANAGER,
                format!("erred workloads: {}", erred.join(", ")),
            );
        }
    }

    /// Kernel failures that aborted a workload degrade the kernel component
    pub fn observe_critical_error(&self, workload_id: &str, err: &DriverError) {
        if let DriverError::Kernel(kernel_err) = err {
            self.set_degraded(
                components::KERNEL,
                format!("workload {}: {}", workload_id, kernel_err),
            );
        }
    }

    pub fn health(&self) -> HealthResponse {
        let components = self.components.read().clone();
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse { status, components }
    }

    /// Ready once initialized, as long as no component is unhealthy
    pub fn readiness(&self) -> ReadinessResponse {
        if !self.ready.load(Ordering::SeqCst) {
            return ReadinessResponse {
                ready: false,
                reason: Some("driver service not yet initialized".to_string()),
            };
        }

        let unhealthy: Vec<String> = self
            .components
            .read()
            .iter()
            .filter(|(_, c)| c.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.clone())
            .collect();

        if unhealthy.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("unhealthy components: {}", unhealthy.join(", "))),
            }
        }
    }
}
