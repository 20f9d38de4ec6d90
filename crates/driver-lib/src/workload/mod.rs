//! Workload aggregate: lifecycle state machine, sessions and statistics
//!
//! A [`Workload`] is owned by exactly one driver. Session clients and the
//! driver loops mutate it concurrently through the accessor methods below,
//! all of which go through a single read/write lock.

mod session;
mod state;
mod statistics;

#[cfg(test)]
mod tests;

pub use session::{Session, SessionState, TemplateSession, TrainingEvent};
pub use state::WorkloadState;
pub use statistics::{Statistics, WorkloadSnapshot, MAX_PROCESSED_EVENT_RECORDS};

use chrono::Utc;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::WorkloadError;
use crate::models::{SessionMetadata, WorkloadEvent};

/// Workload built from a named preset; its events come from an external generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetWorkload {
    pub preset_key: String,
    pub preset_name: String,
}

/// Workload built from an explicit list of template sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateWorkload {
    pub sessions: Vec<TemplateSession>,
}

/// The workload variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkloadKind {
    Preset(PresetWorkload),
    Template(TemplateWorkload),
}

impl WorkloadKind {
    pub fn label(&self) -> &'static str {
        match self {
            WorkloadKind::Preset(_) => "preset",
            WorkloadKind::Template(_) => "template",
        }
    }
}

/// Output stream of a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

struct WorkloadInner {
    state: WorkloadState,
    statistics: Statistics,
    sessions: HashMap<String, Session>,
    sampled_sessions: HashSet<String>,
    unsampled_sessions: HashSet<String>,
    started_at: Option<Instant>,
    pause_wait_begin: Option<Instant>,
    time_spent_paused: Duration,
    rng: StdRng,
}

impl WorkloadInner {
    fn set_state(&mut self, state: WorkloadState) {
        self.state = state;
        self.statistics.workload_state = state;
    }

    /// Wall-clock run time with every paused interval removed
    fn active_time(&self) -> Duration {
        self.started_at
            .map(|start| start.elapsed().saturating_sub(self.time_spent_paused))
            .unwrap_or_default()
    }

    fn is_session_being_sampled(&mut self, session_id: &str) -> bool {
        if self.unsampled_sessions.contains(session_id) {
            return false;
        }
        if self.sampled_sessions.contains(session_id) {
            return true;
        }

        let draw: f64 = self.rng.random();
        if draw < self.statistics.sessions_sample_percentage {
            self.sampled_sessions.insert(session_id.to_string());
            self.statistics.num_sampled_sessions += 1;
            true
        } else {
            self.unsampled_sessions.insert(session_id.to_string());
            self.statistics.num_discarded_sessions += 1;
            if let Some(session) = self.sessions.get_mut(session_id) {
                let _ = session.set_state(SessionState::Discarded);
            }
            false
        }
    }
}

/// One simulation run
pub struct Workload {
    id: String,
    name: String,
    seed: u64,
    kind: WorkloadKind,
    inner: RwLock<WorkloadInner>,
}

impl std::fmt::Debug for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workload")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .field("state", &self.state())
            .finish()
    }
}

impl Workload {
    /// Register a workload.
    ///
    /// Template sessions are validated and the sampling decision for each
    /// of them is made here, using `seed`.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        seed: u64,
        sessions_sample_percentage: f64,
        kind: WorkloadKind,
    ) -> Result<Self, WorkloadError> {
        let id = id.into();
        let mut inner = WorkloadInner {
            state: WorkloadState::Ready,
            statistics: Statistics::new(sessions_sample_percentage.clamp(0.0, 1.0)),
            sessions: HashMap::new(),
            sampled_sessions: HashSet::new(),
            unsampled_sessions: HashSet::new(),
            started_at: None,
            pause_wait_begin: None,
            time_spent_paused: Duration::ZERO,
            rng: StdRng::seed_from_u64(seed),
        };

        if let WorkloadKind::Template(template) = &kind {
            let mut seen = HashSet::new();
            for session in &template.sessions {
                session.validate()?;
                if !seen.insert(session.id.as_str()) {
                    return Err(WorkloadError::InvalidTemplate(format!(
                        "duplicate session id {}",
                        session.id
                    )));
                }
                inner
                    .sessions
                    .insert(session.id.clone(), Session::from_template(session));
                inner.is_session_being_sampled(&session.id);
            }
            inner.statistics.total_num_sessions = template.sessions.len();

            debug!(
                workload_id = %id,
                total_num_sessions = template.sessions.len(),
                sessions_sampled = inner.statistics.num_sampled_sessions,
                sessions_discarded = inner.statistics.num_discarded_sessions,
                "Registered template workload"
            );
        }

        Ok(Self {
            id,
            name: name.into(),
            seed,
            kind,
            inner: RwLock::new(inner),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn kind(&self) -> &WorkloadKind {
        &self.kind
    }

    pub fn state(&self) -> WorkloadState {
        self.inner.read().state
    }

    pub fn is_in_progress(&self) -> bool {
        self.state().is_in_progress()
    }

    // Lifecycle

    pub fn start_workload(&self) -> Result<(), WorkloadError> {
        let mut inner = self.inner.write();
        if inner.state != WorkloadState::Ready {
            return Err(WorkloadError::NotReady(inner.state));
        }

        inner.started_at = Some(Instant::now());
        inner.statistics.start_time = Some(Utc::now());
        inner.set_state(WorkloadState::Running);
        Ok(())
    }

    pub fn set_pausing(&self) -> Result<(), WorkloadError> {
        let mut inner = self.inner.write();
        if inner.state != WorkloadState::Running {
            return Err(WorkloadError::NotRunning(inner.state));
        }
        inner.set_state(WorkloadState::Pausing);
        Ok(())
    }

    /// Pausing -> Paused; also starts the paused-time measurement
    pub fn set_paused(&self) -> Result<(), WorkloadError> {
        let mut inner = self.inner.write();
        if inner.state != WorkloadState::Pausing {
            return Err(WorkloadError::InvalidTransition {
                from: inner.state,
                to: WorkloadState::Paused,
            });
        }
        inner.set_state(WorkloadState::Paused);
        inner.pause_wait_begin = Some(Instant::now());
        Ok(())
    }

    /// Paused or Pausing -> Running, folding the pause into paused time
    pub fn unpause(&self) -> Result<(), WorkloadError> {
        let mut inner = self.inner.write();
        if !matches!(inner.state, WorkloadState::Paused | WorkloadState::Pausing) {
            return Err(WorkloadError::NotPaused(inner.state));
        }

        if let Some(began) = inner.pause_wait_begin.take() {
            inner.time_spent_paused += began.elapsed();
            inner.statistics.time_spent_paused_millis = inner.time_spent_paused.as_millis() as u64;
        }
        inner.set_state(WorkloadState::Running);
        Ok(())
    }

    /// Undo a pause request that never took effect; true if it did so
    pub(crate) fn cancel_pausing(&self) -> bool {
        let mut inner = self.inner.write();
        if inner.state != WorkloadState::Pausing {
            return false;
        }
        inner.set_state(WorkloadState::Running);
        true
    }

    pub fn set_workload_completed(&self) -> Result<(), WorkloadError> {
        let mut inner = self.inner.write();
        match inner.state {
            WorkloadState::Finished => return Err(WorkloadError::AlreadyCompleted),
            state if state.is_terminal() => {
                return Err(WorkloadError::InvalidTransition {
                    from: state,
                    to: WorkloadState::Finished,
                })
            }
            _ => {}
        }

        if let Some(began) = inner.pause_wait_begin.take() {
            inner.time_spent_paused += began.elapsed();
        }
        let active = inner.active_time();
        inner.statistics.time_elapsed_millis = active.as_millis() as u64;
        inner.statistics.workload_duration_millis = Some(active.as_millis() as u64);
        inner.statistics.end_time = Some(Utc::now());
        inner.set_state(WorkloadState::Finished);
        Ok(())
    }

    pub fn terminate_workload_prematurely(&self) -> Result<(), WorkloadError> {
        let mut inner = self.inner.write();
        if !inner.state.is_in_progress() {
            return Err(WorkloadError::NotRunning(inner.state));
        }

        if let Some(began) = inner.pause_wait_begin.take() {
            inner.time_spent_paused += began.elapsed();
        }
        let active = inner.active_time();
        inner.statistics.time_elapsed_millis = active.as_millis() as u64;
        inner.statistics.time_spent_paused_millis = inner.time_spent_paused.as_millis() as u64;
        inner.statistics.end_time = Some(Utc::now());
        inner.set_state(WorkloadState::Terminated);
        Ok(())
    }

    /// Unconditionally mark the workload as erred
    pub fn set_erred(&self, message: impl Into<String>) {
        let mut inner = self.inner.write();
        if inner.statistics.end_time.is_none() {
            inner.statistics.end_time = Some(Utc::now());
        }
        inner.statistics.error_message = Some(message.into());
        inner.set_state(WorkloadState::Erred);
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.read().statistics.error_message.clone()
    }

    /// Refresh the elapsed-time statistic; a no-op while paused
    pub fn update_time_elapsed(&self) {
        let mut inner = self.inner.write();
        if inner.state == WorkloadState::Paused || inner.state.is_terminal() {
            return;
        }
        inner.statistics.time_elapsed_millis = inner.active_time().as_millis() as u64;
    }

    // Statistics access

    pub fn get_statistics(&self) -> Statistics {
        self.inner.read().statistics.clone()
    }

    /// Apply `f` to the statistics under the exclusive lock
    pub fn update_statistics<F>(&self, f: F)
    where
        F: FnOnce(&mut Statistics),
    {
        f(&mut self.inner.write().statistics)
    }

    pub fn snapshot(&self) -> WorkloadSnapshot {
        let inner = self.inner.read();
        WorkloadSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind.label().to_string(),
            seed: self.seed,
            state: inner.state,
            statistics: inner.statistics.clone(),
        }
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.inner.read().sessions.get(session_id).cloned()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.read().sessions.values().cloned().collect()
    }

    // Sampling

    /// Whether events of `session_id` are processed.
    ///
    /// The first call for a session draws against the sample percentage;
    /// later calls return the same answer.
    pub fn is_session_being_sampled(&self, session_id: &str) -> bool {
        {
            let inner = self.inner.read();
            if inner.sampled_sessions.contains(session_id) {
                return true;
            }
            if inner.unsampled_sessions.contains(session_id) {
                return false;
            }
        }
        self.inner.write().is_session_being_sampled(session_id)
    }

    // Per-session bookkeeping

    pub fn session_created(&self, session_id: &str, metadata: &SessionMetadata, latency: Duration) {
        let mut inner = self.inner.write();
        inner.statistics.num_active_sessions += 1;
        inner.statistics.num_sessions_created += 1;
        inner
            .statistics
            .session_creation_latencies_millis
            .push(latency.as_millis() as u64);
        if matches!(self.kind, WorkloadKind::Preset(_)) {
            inner.statistics.total_num_sessions = inner
                .statistics
                .total_num_sessions
                .max(inner.statistics.num_sessions_created as usize);
        }

        let session = inner
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id, metadata.max_resources.clone()));
        session.created_at = Some(Utc::now());
        session.current_resources = metadata.current_resources.clone();
        if let Err(e) = session.set_state(SessionState::Idle) {
            warn!(workload_id = %self.id, session_id = %session_id, error = %e, "Failed to mark session idle");
        }
    }

    pub fn session_stopped(&self, session_id: &str, latency: Duration) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.statistics.num_active_sessions -= 1;
        inner
            .statistics
            .session_termination_latencies_millis
            .push(latency.as_millis() as u64);

        if let Some(session) = inner.sessions.get_mut(session_id) {
            if session.state == SessionState::Training {
                inner.statistics.num_active_trainings -= 1;
            }
            let _ = session.set_state(SessionState::Stopped);
        }
    }

    pub fn session_erred(&self, session_id: &str) {
        let mut inner = self.inner.write();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            let _ = session.set_state(SessionState::Erred);
        }
    }

    pub fn training_submitted(&self, session_id: &str, exec_request_time: Duration) {
        let mut inner = self.inner.write();
        inner.statistics.num_submitted_trainings += 1;
        inner
            .statistics
            .exec_request_times_millis
            .push(exec_request_time.as_millis() as u64);
        debug!(workload_id = %self.id, session_id = %session_id, "Training submitted");
    }

    pub fn training_started(&self, session_id: &str, start_latency: Duration) {
        let mut inner = self.inner.write();
        inner.statistics.num_submitted_trainings -= 1;
        inner.statistics.num_active_trainings += 1;
        inner
            .statistics
            .training_start_latencies_millis
            .push(start_latency.as_millis() as u64);

        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.training_started_at = Some(Utc::now());
            if let Err(e) = session.set_state(SessionState::Training) {
                warn!(workload_id = %self.id, session_id = %session_id, error = %e, "Failed to mark session training");
            }
        }
    }

    /// A submitted training never started and will be retried
    pub fn training_start_failed(&self, session_id: &str) {
        let mut inner = self.inner.write();
        inner.statistics.num_submitted_trainings -= 1;
        debug!(workload_id = %self.id, session_id = %session_id, "Training failed to start");
    }

    /// The kernel never confirmed a submitted training in time
    pub fn training_start_timed_out(&self, session_id: &str) {
        let mut inner = self.inner.write();
        inner.statistics.num_submitted_trainings -= 1;
        debug!(workload_id = %self.id, session_id = %session_id, "Training start timed out");
    }

    pub fn training_stopped(&self, session_id: &str, duration_in_ticks: u64, reply_latency: Duration) {
        let mut inner = self.inner.write();
        inner.statistics.num_tasks_executed += 1;
        inner.statistics.cumulative_training_time_ticks += duration_in_ticks;
        inner
            .statistics
            .total_reply_latencies_millis
            .push(reply_latency.as_millis() as u64);

        let was_training = match inner.sessions.get_mut(session_id) {
            Some(session) => {
                let was_training = session.state == SessionState::Training;
                session.trainings_completed += 1;
                let _ = session.set_state(SessionState::Idle);
                was_training
            }
            None => true,
        };
        if was_training {
            inner.statistics.num_active_trainings -= 1;
        }
    }

    /// Record backoff incurred by a session
    pub fn session_delayed(&self, session_id: &str, delay: chrono::Duration) {
        let mut inner = self.inner.write();
        inner.statistics.num_times_session_delayed_resource_contention += 1;
        inner.statistics.aggregate_session_delay_millis += delay.num_milliseconds();

        if let WorkloadKind::Template(_) = self.kind {
            if let Some(session) = inner.sessions.get_mut(session_id) {
                session.total_delay_millis += delay.num_milliseconds();
            }
        }
    }

    pub fn session_output(&self, session_id: &str, stream: OutputStream, text: impl Into<String>) {
        let mut inner = self.inner.write();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            match stream {
                OutputStream::Stdout => session.stdout.push(text.into()),
                OutputStream::Stderr => session.stderr.push(text.into()),
            }
        }
    }

    pub fn processed_event(&self, event: WorkloadEvent) {
        self.inner.write().statistics.record_processed(event);
    }

    /// An event arrived for a session that has no client
    pub fn event_discarded(&self, session_id: &str) {
        let mut inner = self.inner.write();
        inner.statistics.num_discarded_events += 1;
        debug!(workload_id = %self.id, session_id = %session_id, "Discarded event");
    }

    /// The processing loop finished dispatching a tick
    pub fn tick_completed(&self, tick_number: u64) {
        let mut inner = self.inner.write();
        inner.statistics.total_num_ticks += 1;
        inner.statistics.current_tick = tick_number;
    }

    /// Wall-clock length of an issued tick, pacing included
    pub fn record_tick_duration(&self, duration: Duration) {
        self.inner
            .write()
            .statistics
            .tick_durations_millis
            .push(duration.as_millis() as u64);
    }
}
