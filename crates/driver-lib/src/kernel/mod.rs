//! Port to the execution backend that hosts simulated sessions
//!
//! The driver only talks to the backend through these traits. The binary
//! wires in [`SimulatedKernel`]; tests script their own implementations.

mod simulated;

pub use simulated::{SimulatedKernel, SimulatedKernelConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::KernelError;
use crate::models::ResourceSpec;
use crate::workload::OutputStream;

/// Code submission for one training
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteRequest {
    pub session_id: String,
    pub code: String,
    /// Wall-clock time the training should run for, already scaled
    pub training_duration: Duration,
    pub resources: ResourceSpec,
}

impl ExecuteRequest {
    pub fn training(
        session_id: impl Into<String>,
        training_duration: Duration,
        resources: ResourceSpec,
    ) -> Self {
        let session_id = session_id.into();
        Self {
            code: format!(
                "training_duration_millis = {}\nsimulate_training(training_duration_millis)",
                training_duration.as_millis()
            ),
            session_id,
            training_duration,
            resources,
        }
    }
}

/// Outcome carried by an execute reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExecuteStatus {
    Ok,
    Error { name: String, value: String },
}

/// Asynchronous messages a kernel sends back about a submission
#[derive(Debug, Clone, PartialEq)]
pub enum KernelNotification {
    TrainingStarted,
    ExecuteReply(ExecuteStatus),
    Stream { stream: OutputStream, text: String },
}

/// Creates and tears down backend sessions
#[async_trait]
pub trait KernelSessionManager: Send + Sync {
    async fn create_session(
        &self,
        session_id: &str,
        resources: &ResourceSpec,
    ) -> Result<Arc<dyn KernelConnection>, KernelError>;

    async fn stop_session(&self, session_id: &str) -> Result<(), KernelError>;
}

/// Connection to the kernel of a single session
#[async_trait]
pub trait KernelConnection: Send + Sync {
    fn session_id(&self) -> &str;

    /// Submit code; progress and the final reply arrive on `notifications`
    async fn submit_code(
        &self,
        request: ExecuteRequest,
        notifications: mpsc::UnboundedSender<KernelNotification>,
    ) -> Result<(), KernelError>;

    /// Interrupt the running training so that it replies
    async fn stop_training_code(&self) -> Result<(), KernelError>;
}
