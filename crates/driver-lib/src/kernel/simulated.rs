//! In-process kernel backend

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{
    ExecuteRequest, ExecuteStatus, KernelConnection, KernelNotification, KernelSessionManager,
};
use crate::error::KernelError;
use crate::models::ResourceSpec;
use crate::workload::OutputStream;

#[derive(Debug, Clone)]
pub struct SimulatedKernelConfig {
    /// Time taken to create a session
    pub create_latency: Duration,
    /// Maximum number of concurrent sessions; unlimited when `None`
    pub capacity: Option<usize>,
}

impl Default for SimulatedKernelConfig {
    fn default() -> Self {
        Self {
            create_latency: Duration::from_millis(50),
            capacity: None,
        }
    }
}

/// Kernel backend that runs entirely inside the driver process.
///
/// Trainings report started as soon as they are submitted and reply once
/// stopped or once their duration has passed, whichever comes first.
pub struct SimulatedKernel {
    config: SimulatedKernelConfig,
    sessions: DashMap<String, Arc<SimulatedConnection>>,
}

impl SimulatedKernel {
    pub fn new(config: SimulatedKernelConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SimulatedKernel {
    fn default() -> Self {
        Self::new(SimulatedKernelConfig::default())
    }
}

#[async_trait]
impl KernelSessionManager for SimulatedKernel {
    async fn create_session(
        &self,
        session_id: &str,
        resources: &ResourceSpec,
    ) -> Result<Arc<dyn KernelConnection>, KernelError> {
        if let Some(capacity) = self.config.capacity {
            if self.sessions.len() >= capacity {
                return Err(KernelError::InsufficientCapacity(format!(
                    "{} of {} session slots in use",
                    self.sessions.len(),
                    capacity
                )));
            }
        }

        tokio::time::sleep(self.config.create_latency).await;

        let connection = Arc::new(SimulatedConnection {
            session_id: session_id.to_string(),
            active: Mutex::new(None),
        });
        self.sessions
            .insert(session_id.to_string(), Arc::clone(&connection));

        debug!(
            session_id = %session_id,
            millicpus = resources.millicpus,
            gpus = resources.gpus,
            "Simulated session created"
        );
        Ok(connection as Arc<dyn KernelConnection>)
    }

    async fn stop_session(&self, session_id: &str) -> Result<(), KernelError> {
        let (_, connection) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| KernelError::UnknownSession(session_id.to_string()))?;

        connection.interrupt();
        debug!(session_id = %session_id, "Simulated session stopped");
        Ok(())
    }
}

struct SimulatedConnection {
    session_id: String,
    active: Mutex<Option<oneshot::Sender<()>>>,
}

impl SimulatedConnection {
    /// Stop the running training, if any; true if one was running
    fn interrupt(&self) -> bool {
        match self.active.lock().take() {
            Some(stop) => stop.send(()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl KernelConnection for SimulatedConnection {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn submit_code(
        &self,
        request: ExecuteRequest,
        notifications: mpsc::UnboundedSender<KernelNotification>,
    ) -> Result<(), KernelError> {
        let (stop_tx, stop_rx) = oneshot::channel();
        {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|stop| !stop.is_closed()) {
                let _ = notifications.send(KernelNotification::ExecuteReply(
                    ExecuteStatus::Error {
                        name: "TrainingInProgress".into(),
                        value: format!("session {} is already training", self.session_id),
                    },
                ));
                return Ok(());
            }
            *active = Some(stop_tx);
        }

        let _ = notifications.send(KernelNotification::TrainingStarted);

        debug!(
            session_id = %self.session_id,
            gpus = request.resources.gpus,
            duration_ms = request.training_duration.as_millis() as u64,
            "Simulated training started"
        );

        let session_id = self.session_id.clone();
        let duration = request.training_duration;
        tokio::spawn(async move {
            let interrupted = tokio::select! {
                _ = stop_rx => true,
                _ = tokio::time::sleep(duration) => false,
            };
            let _ = notifications.send(KernelNotification::Stream {
                stream: OutputStream::Stdout,
                text: format!(
                    "training finished after {}ms (interrupted: {})",
                    duration.as_millis(),
                    interrupted
                ),
            });
            let _ = notifications.send(KernelNotification::ExecuteReply(ExecuteStatus::Ok));
            debug!(session_id = %session_id, interrupted, "Simulated training replied");
        });

        Ok(())
    }

    async fn stop_training_code(&self) -> Result<(), KernelError> {
        self.interrupt();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources() -> ResourceSpec {
        ResourceSpec::new(1000.0, 1024.0, 1, 2.0)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<KernelNotification>) -> KernelNotification {
        rx.recv().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_training_completes_on_stop() {
        let kernel = SimulatedKernel::default();
        let conn = kernel.create_session("s1", &resources()).await.unwrap();
        assert_eq!(conn.session_id(), "s1");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = ExecuteRequest::training("s1", Duration::from_secs(3600), resources());
        conn.submit_code(request, tx).await.unwrap();
        assert_eq!(next(&mut rx).await, KernelNotification::TrainingStarted);

        conn.stop_training_code().await.unwrap();
        assert!(matches!(next(&mut rx).await, KernelNotification::Stream { .. }));
        assert_eq!(
            next(&mut rx).await,
            KernelNotification::ExecuteReply(ExecuteStatus::Ok)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_training_completes_after_duration() {
        let kernel = SimulatedKernel::default();
        let conn = kernel.create_session("s1", &resources()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = ExecuteRequest::training("s1", Duration::from_secs(5), resources());
        conn.submit_code(request, tx).await.unwrap();
        assert_eq!(next(&mut rx).await, KernelNotification::TrainingStarted);

        let started = tokio::time::Instant::now();
        next(&mut rx).await;
        assert_eq!(
            next(&mut rx).await,
            KernelNotification::ExecuteReply(ExecuteStatus::Ok)
        );
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_limit() {
        let kernel = SimulatedKernel::new(SimulatedKernelConfig {
            create_latency: Duration::ZERO,
            capacity: Some(1),
        });
        kernel.create_session("s1", &resources()).await.unwrap();

        let err = kernel.create_session("s2", &resources()).await.err().unwrap();
        assert!(matches!(err, KernelError::InsufficientCapacity(_)));

        kernel.stop_session("s1").await.unwrap();
        assert!(kernel.create_session("s2", &resources()).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_unknown_session() {
        let kernel = SimulatedKernel::default();
        assert_eq!(
            kernel.stop_session("missing").await,
            Err(KernelError::UnknownSession("missing".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_submission_is_rejected() {
        let kernel = SimulatedKernel::default();
        let conn = kernel.create_session("s1", &resources()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = ExecuteRequest::training("s1", Duration::from_secs(60), resources());
        conn.submit_code(request.clone(), tx.clone()).await.unwrap();
        assert_eq!(next(&mut rx).await, KernelNotification::TrainingStarted);

        conn.submit_code(request, tx).await.unwrap();
        assert!(matches!(
            next(&mut rx).await,
            KernelNotification::ExecuteReply(ExecuteStatus::Error { .. })
        ));
    }
}
