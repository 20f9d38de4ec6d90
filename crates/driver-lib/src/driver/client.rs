//! Per-session client
//!
//! Each admitted session gets one client task. It receives that session's
//! events in order on a private channel and performs the corresponding
//! kernel operations. The dispatcher holds the session's queued events
//! while a kernel round trip is outstanding; the client releases the hold
//! once the round trip has finished.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::DriverShared;
use crate::error::{DriverError, KernelError};
use crate::kernel::{ExecuteRequest, ExecuteStatus, KernelConnection, KernelNotification};
use crate::models::{Event, EventName, WorkloadEvent};

/// Base of the session creation backoff
const CREATE_BACKOFF_BASE: Duration = Duration::from_secs(5);
/// Upper bound on a single backoff step
const CREATE_BACKOFF_CAP: Duration = Duration::from_secs(120);
const CREATE_BACKOFF_FACTOR: u32 = 2;
const CREATE_BACKOFF_STEPS: u32 = 10;
const CREATE_BACKOFF_JITTER_MS: u64 = 250;

/// Exponential backoff used while the backend lacks capacity
#[derive(Debug)]
pub(super) struct Backoff {
    next: Duration,
    remaining: u32,
}

impl Backoff {
    pub(super) fn new() -> Self {
        Self {
            next: CREATE_BACKOFF_BASE,
            remaining: CREATE_BACKOFF_STEPS,
        }
    }

    /// The next delay, or `None` once all steps are used up
    pub(super) fn step(&mut self, rng: &mut StdRng) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let jitter = Duration::from_millis(rng.random_range(0..=CREATE_BACKOFF_JITTER_MS));
        let delay = self.next + jitter;
        self.next = std::cmp::min(self.next * CREATE_BACKOFF_FACTOR, CREATE_BACKOFF_CAP);
        Some(delay)
    }
}

/// A training that has been submitted to the kernel
struct ActiveTraining {
    notifications: mpsc::UnboundedReceiver<KernelNotification>,
    duration_in_ticks: u64,
}

/// How a training start attempt ended
enum StartOutcome {
    Started,
    Failed { name: String, value: String },
    Disconnected,
}

pub(super) struct SessionClient {
    shared: Arc<DriverShared>,
    session_id: String,
    generation: u64,
    events: mpsc::Receiver<Event>,
    connection: Option<Arc<dyn KernelConnection>>,
    training: Option<ActiveTraining>,
    rng: StdRng,
}

impl SessionClient {
    pub(super) fn new(
        shared: Arc<DriverShared>,
        session_id: String,
        generation: u64,
        events: mpsc::Receiver<Event>,
    ) -> Self {
        let rng = StdRng::seed_from_u64(shared.workload.seed() ^ generation);
        Self {
            shared,
            session_id,
            generation,
            events,
            connection: None,
            training: None,
            rng,
        }
    }

    /// Create the session, then process its events until it stops or
    /// the dispatcher goes away
    pub(super) async fn run(mut self, first: Event) {
        if first.name != EventName::SessionReady {
            self.release_hold();
            self.shared.report_error(DriverError::InvalidFirstEvent {
                session_id: self.session_id.clone(),
                name: first.name,
            });
            self.unregister();
            return;
        }

        if !self.initialize(first).await {
            return;
        }

        while let Some(event) = self.events.recv().await {
            let name = event.name;
            let result = match name {
                EventName::TrainingStarted => self.start_training(event).await,
                EventName::TrainingEnded => self.stop_training(event).await,
                EventName::UpdateGpuUtil => {
                    self.record_processed(&event, None);
                    Ok(())
                }
                EventName::SessionStopped => {
                    self.stop_session(event).await;
                    break;
                }
                EventName::SessionReady => Err(DriverError::UnknownEventType(name)),
            };

            if let Err(e) = result {
                self.shared.report_error(e);
            }
        }

        self.unregister();
        debug!(
            workload_id = %self.shared.workload_id(),
            session_id = %self.session_id,
            "Session client exited"
        );
    }

    fn release_hold(&self) {
        self.shared
            .event_queue
            .release_event_hold_for_session(&self.session_id);
    }

    /// Remove this client from the registry unless a newer one replaced it
    fn unregister(&self) {
        self.shared
            .clients
            .remove_if(&self.session_id, |_, handle| handle.generation == self.generation);
    }

    fn record_processed(&self, event: &Event, error: Option<String>) {
        self.shared
            .workload
            .processed_event(WorkloadEvent::processed(event, event.name, error));
        self.shared
            .metrics
            .inc_events_processed(self.shared.workload_id());
    }

    fn delay_session(&self, delay: chrono::Duration) {
        self.shared.event_queue.delay_session(&self.session_id, delay);
        self.shared.workload.session_delayed(&self.session_id, delay);
        self.shared
            .metrics
            .inc_sessions_delayed(self.shared.workload_id());
    }

    /// Create the backend session; false if the client should exit
    async fn initialize(&mut self, first: Event) -> bool {
        let shared = Arc::clone(&self.shared);
        let resources = first.metadata.max_resources.clone();
        let mut backoff = Backoff::new();
        let mut shutdown = shared.shutdown.subscribe();
        let started = Instant::now();

        loop {
            match shared.kernel.create_session(&self.session_id, &resources).await {
                Ok(connection) => {
                    self.connection = Some(connection);
                    shared
                        .workload
                        .session_created(&self.session_id, &first.metadata, started.elapsed());
                    self.record_processed(&first, None);
                    self.release_hold();
                    info!(
                        workload_id = %shared.workload_id(),
                        session_id = %self.session_id,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "Session created"
                    );
                    return true;
                }
                Err(KernelError::InsufficientCapacity(reason)) => {
                    let Some(step) = backoff.step(&mut self.rng) else {
                        warn!(
                            workload_id = %shared.workload_id(),
                            session_id = %self.session_id,
                            "Session creation retries exhausted, rescheduling SessionReady"
                        );
                        self.delay_session(shared.config.tick_duration * 2);
                        self.unregister();
                        shared.event_queue.enqueue_event(first);
                        self.release_hold();
                        return false;
                    };

                    let delay = chrono::Duration::from_std(step)
                        .unwrap_or_else(|_| chrono::Duration::seconds(120));
                    self.delay_session(delay);
                    warn!(
                        workload_id = %shared.workload_id(),
                        session_id = %self.session_id,
                        reason = %reason,
                        delay_ms = delay.num_milliseconds(),
                        "Insufficient capacity for session, backing off"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(shared.config.adjusted(delay)) => {}
                        _ = shutdown.recv() => {
                            self.release_hold();
                            return false;
                        }
                    }
                }
                Err(e) => {
                    shared.workload.session_erred(&self.session_id);
                    self.record_processed(&first, Some(e.to_string()));
                    self.unregister();
                    self.release_hold();
                    shared.report_error(e.into());
                    return false;
                }
            }
        }
    }

    fn connection(&self) -> Result<Arc<dyn KernelConnection>, DriverError> {
        self.connection
            .clone()
            .ok_or_else(|| KernelError::UnknownSession(self.session_id.clone()).into())
    }

    async fn start_training(&mut self, event: Event) -> Result<(), DriverError> {
        let result = self.submit_training(event).await;
        self.release_hold();
        result
    }

    async fn submit_training(&mut self, event: Event) -> Result<(), DriverError> {
        let shared = Arc::clone(&self.shared);
        let connection = self.connection()?;

        if self.training.is_some() {
            warn!(
                workload_id = %shared.workload_id(),
                session_id = %self.session_id,
                "Training started while a previous one is still active"
            );
        }

        let (tx, mut notifications) = mpsc::unbounded_channel();
        let request = ExecuteRequest::training(
            self.session_id.clone(),
            shared.config.adjusted(event.duration),
            event.metadata.current_resources.clone(),
        );

        let submitted = Instant::now();
        connection.submit_code(request, tx).await?;
        shared
            .workload
            .training_submitted(&self.session_id, submitted.elapsed());

        let timeout = shared.config.training_timeout(event.duration);
        let outcome = tokio::time::timeout(timeout, self.await_start(&mut notifications)).await;
        let duration_in_ticks = (event.duration.num_milliseconds()
            / shared.config.tick_duration.num_milliseconds().max(1))
        .max(0) as u64;

        match outcome {
            Ok(StartOutcome::Started) => {
                let latency = submitted.elapsed();
                shared.workload.training_started(&self.session_id, latency);
                shared
                    .metrics
                    .observe_training_start_latency(shared.workload_id(), latency.as_secs_f64());
                self.training = Some(ActiveTraining {
                    notifications,
                    duration_in_ticks,
                });
                self.record_processed(&event, None);
                Ok(())
            }
            Ok(StartOutcome::Failed { name, value }) => {
                shared.workload.training_start_failed(&self.session_id);
                let elapsed = chrono::Duration::from_std(submitted.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
                let delay = elapsed + shared.config.tick_duration * 2;
                warn!(
                    workload_id = %shared.workload_id(),
                    session_id = %self.session_id,
                    error_name = %name,
                    error_value = %value,
                    delay_ms = delay.num_milliseconds(),
                    "Training failed to start, rescheduling"
                );
                self.delay_session(delay);
                shared.event_queue.enqueue_event(event);
                Ok(())
            }
            Ok(StartOutcome::Disconnected) => {
                shared.workload.training_start_failed(&self.session_id);
                Err(KernelError::Backend(format!(
                    "kernel of session {} closed its notifications before training started",
                    self.session_id
                ))
                .into())
            }
            Err(_) => {
                shared.workload.training_start_timed_out(&self.session_id);
                warn!(
                    workload_id = %shared.workload_id(),
                    session_id = %self.session_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for training to start"
                );
                // keep the submission so the matching TrainingEnded can stop it
                self.training = Some(ActiveTraining {
                    notifications,
                    duration_in_ticks,
                });
                self.record_processed(&event, Some("training start timed out".into()));
                Err(DriverError::TrainingStartTimeout {
                    session_id: self.session_id.clone(),
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn await_start(
        &self,
        notifications: &mut mpsc::UnboundedReceiver<KernelNotification>,
    ) -> StartOutcome {
        while let Some(notification) = notifications.recv().await {
            match notification {
                KernelNotification::TrainingStarted => return StartOutcome::Started,
                KernelNotification::ExecuteReply(ExecuteStatus::Error { name, value }) => {
                    return StartOutcome::Failed { name, value }
                }
                KernelNotification::ExecuteReply(ExecuteStatus::Ok) => {
                    // finished before the start notification arrived
                    return StartOutcome::Started;
                }
                KernelNotification::Stream { stream, text } => {
                    self.shared
                        .workload
                        .session_output(&self.session_id, stream, text);
                }
            }
        }
        StartOutcome::Disconnected
    }

    async fn await_reply(
        &self,
        notifications: &mut mpsc::UnboundedReceiver<KernelNotification>,
    ) -> Option<ExecuteStatus> {
        while let Some(notification) = notifications.recv().await {
            match notification {
                KernelNotification::ExecuteReply(status) => return Some(status),
                KernelNotification::Stream { stream, text } => {
                    self.shared
                        .workload
                        .session_output(&self.session_id, stream, text);
                }
                KernelNotification::TrainingStarted => {}
            }
        }
        None
    }

    async fn stop_training(&mut self, event: Event) -> Result<(), DriverError> {
        let result = self.finish_training(&event).await;
        self.release_hold();
        result
    }

    async fn finish_training(&mut self, event: &Event) -> Result<(), DriverError> {
        let shared = Arc::clone(&self.shared);
        let Some(mut training) = self.training.take() else {
            warn!(
                workload_id = %shared.workload_id(),
                session_id = %self.session_id,
                "TrainingEnded without an active training"
            );
            self.record_processed(event, Some("no active training".into()));
            return Ok(());
        };

        let connection = self.connection()?;
        let stop_requested = Instant::now();
        connection.stop_training_code().await?;

        let timeout = shared.config.training_timeout(event.duration);
        match tokio::time::timeout(timeout, self.await_reply(&mut training.notifications)).await {
            Ok(Some(status)) => {
                let reply_latency = stop_requested.elapsed();
                shared.workload.training_stopped(
                    &self.session_id,
                    training.duration_in_ticks,
                    reply_latency,
                );
                let error = match status {
                    ExecuteStatus::Ok => None,
                    ExecuteStatus::Error { name, value } => {
                        warn!(
                            workload_id = %shared.workload_id(),
                            session_id = %self.session_id,
                            error_name = %name,
                            error_value = %value,
                            "Training replied with an error"
                        );
                        Some(format!("{name}: {value}"))
                    }
                };
                self.record_processed(event, error);
                Ok(())
            }
            Ok(None) => Err(KernelError::Backend(format!(
                "kernel of session {} closed its notifications before replying",
                self.session_id
            ))
            .into()),
            Err(_) => {
                warn!(
                    workload_id = %shared.workload_id(),
                    session_id = %self.session_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for training to stop"
                );
                self.record_processed(event, Some("training stop timed out".into()));
                Err(DriverError::TrainingStopTimeout {
                    session_id: self.session_id.clone(),
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn stop_session(&mut self, event: Event) {
        let shared = Arc::clone(&self.shared);

        if self.training.take().is_some() {
            if let Some(connection) = &self.connection {
                if let Err(e) = connection.stop_training_code().await {
                    debug!(
                        session_id = %self.session_id,
                        error = %e,
                        "Failed to interrupt training before stopping session"
                    );
                }
            }
        }

        let started = Instant::now();
        match shared.kernel.stop_session(&self.session_id).await {
            Ok(()) => {
                shared
                    .workload
                    .session_stopped(&self.session_id, started.elapsed());
                self.record_processed(&event, None);
                info!(
                    workload_id = %shared.workload_id(),
                    session_id = %self.session_id,
                    "Session stopped"
                );
            }
            Err(e) => {
                self.record_processed(&event, Some(e.to_string()));
                shared.report_error(e.into());
            }
        }
        self.connection = None;
    }
}
