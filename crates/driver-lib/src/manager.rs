//! Workload manager
//!
//! Owns one [`WorkloadDriver`] per registered workload and periodically
//! publishes snapshots of all of them to subscribers.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::driver::{DriverConfig, ErrorHandlers, WorkloadDriver};
use crate::error::ManagerError;
use crate::generator::WorkloadGenerator;
use crate::kernel::KernelSessionManager;
use crate::observability::{MetricsPort, NoopMetrics};
use crate::workload::{
    TemplateSession, TemplateWorkload, Workload, WorkloadKind, WorkloadSnapshot,
};

/// Buffered snapshot batches per subscriber
const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

/// Request to register a template workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRegistration {
    pub name: String,
    /// Random when absent
    #[serde(default)]
    pub seed: Option<u64>,
    /// Falls back to the manager's default when absent
    #[serde(default)]
    pub sessions_sample_percentage: Option<f64>,
    pub sessions: Vec<TemplateSession>,
}

pub struct WorkloadManager {
    drivers: DashMap<String, Arc<WorkloadDriver>>,
    kernel: Arc<dyn KernelSessionManager>,
    metrics: Arc<dyn MetricsPort>,
    handlers: ErrorHandlers,
    config: DriverConfig,
    sessions_sample_percentage: f64,
    snapshots: broadcast::Sender<Vec<WorkloadSnapshot>>,
    next_id: AtomicU64,
}

impl WorkloadManager {
    pub fn new(kernel: Arc<dyn KernelSessionManager>, config: DriverConfig) -> Self {
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self {
            drivers: DashMap::new(),
            kernel,
            metrics: Arc::new(NoopMetrics),
            handlers: ErrorHandlers::default(),
            config,
            sessions_sample_percentage: 1.0,
            snapshots,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsPort>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_error_handlers(mut self, handlers: ErrorHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Sampling fraction for registrations that do not specify one
    pub fn with_sessions_sample_percentage(mut self, percentage: f64) -> Self {
        self.sessions_sample_percentage = percentage;
        self
    }

    /// Build a driver for `workload` and add it to the registry
    pub fn register(
        &self,
        workload: Workload,
        generator: Option<Arc<dyn WorkloadGenerator>>,
    ) -> Result<Arc<WorkloadDriver>, ManagerError> {
        let id = workload.id().to_string();
        let slot = match self.drivers.entry(id.clone()) {
            Entry::Occupied(_) => return Err(ManagerError::DuplicateWorkload(id)),
            Entry::Vacant(slot) => slot,
        };

        let mut builder = WorkloadDriver::builder()
            .workload(Arc::new(workload))
            .kernel(Arc::clone(&self.kernel))
            .metrics(Arc::clone(&self.metrics))
            .error_handlers(self.handlers.clone())
            .config(self.config.clone());
        if let Some(generator) = generator {
            builder = builder.generator(generator);
        }
        let driver = Arc::new(builder.build()?);
        slot.insert(Arc::clone(&driver));

        info!(workload_id = %id, total_workloads = self.drivers.len(), "Registered workload");
        Ok(driver)
    }

    /// Register a template workload under a freshly assigned id
    pub fn register_template(
        &self,
        registration: TemplateRegistration,
    ) -> Result<Arc<WorkloadDriver>, ManagerError> {
        let workload = Workload::new(
            self.next_workload_id(),
            registration.name,
            registration.seed.unwrap_or_else(rand::random),
            registration
                .sessions_sample_percentage
                .unwrap_or(self.sessions_sample_percentage),
            WorkloadKind::Template(TemplateWorkload {
                sessions: registration.sessions,
            }),
        )?;
        self.register(workload, None)
    }

    fn next_workload_id(&self) -> String {
        loop {
            let id = format!("workload-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
            if !self.drivers.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkloadDriver>> {
        self.drivers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn driver(&self, id: &str) -> Result<Arc<WorkloadDriver>, ManagerError> {
        self.get(id)
            .ok_or_else(|| ManagerError::UnknownWorkload(id.to_string()))
    }

    pub fn start(&self, id: &str) -> Result<WorkloadSnapshot, ManagerError> {
        let driver = self.driver(id)?;
        driver.start()?;
        Ok(driver.workload().snapshot())
    }

    pub fn pause(&self, id: &str) -> Result<WorkloadSnapshot, ManagerError> {
        let driver = self.driver(id)?;
        driver.pause()?;
        Ok(driver.workload().snapshot())
    }

    pub fn unpause(&self, id: &str) -> Result<WorkloadSnapshot, ManagerError> {
        let driver = self.driver(id)?;
        driver.unpause()?;
        Ok(driver.workload().snapshot())
    }

    pub fn stop(&self, id: &str) -> Result<WorkloadSnapshot, ManagerError> {
        let driver = self.driver(id)?;
        driver.stop()?;
        Ok(driver.workload().snapshot())
    }

    pub fn snapshot(&self, id: &str) -> Result<WorkloadSnapshot, ManagerError> {
        Ok(self.driver(id)?.workload().snapshot())
    }

    /// Snapshots of every workload, oldest registration first
    pub fn list(&self) -> Vec<WorkloadSnapshot> {
        let mut snapshots: Vec<WorkloadSnapshot> = self
            .drivers
            .iter()
            .map(|entry| entry.value().workload().snapshot())
            .collect();
        snapshots.sort_by(|a, b| {
            a.statistics
                .registered_time
                .cmp(&b.statistics.registered_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        snapshots
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Number of workloads that are running or paused
    pub fn num_active(&self) -> usize {
        self.drivers
            .iter()
            .filter(|entry| entry.value().workload().is_in_progress())
            .count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<WorkloadSnapshot>> {
        self.snapshots.subscribe()
    }

    /// Publish all snapshots every `period` until `shutdown` fires
    pub fn spawn_push_loop(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_ms = period.as_millis() as u64, "Starting snapshot push loop");
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if manager.is_empty() {
                            continue;
                        }
                        let snapshots = manager.list();
                        let count = snapshots.len();
                        if manager.snapshots.send(snapshots).is_err() {
                            debug!(workloads = count, "No snapshot subscribers");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Snapshot push loop shutting down");
                        break;
                    }
                }
            }
        })
    }
}
