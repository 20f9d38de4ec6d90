//! Event sources feeding a workload driver
//!
//! A [`WorkloadGenerator`] pushes events into an [`EventSink`] and calls
//! [`EventSink::complete`] once it has nothing more to submit. Template
//! workloads get a [`TemplateGenerator`]; preset workloads bring their own
//! implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::DriverError;
use crate::models::{Event, EventName, SessionMetadata};
use crate::workload::{TemplateSession, Workload};

#[async_trait]
pub trait WorkloadGenerator: Send + Sync {
    /// Submit every event of the workload, then complete the sink
    async fn generate(&self, sink: EventSink) -> Result<(), DriverError>;
}

/// Entry point generators submit events through
pub struct EventSink {
    tx: mpsc::Sender<Event>,
    complete: oneshot::Sender<()>,
    workload: Arc<Workload>,
}

impl EventSink {
    pub(crate) fn new(
        tx: mpsc::Sender<Event>,
        complete: oneshot::Sender<()>,
        workload: Arc<Workload>,
    ) -> Self {
        Self {
            tx,
            complete,
            workload,
        }
    }

    /// Submit an event; events of unsampled sessions are dropped here
    pub async fn submit_event(&self, event: Event) -> Result<(), DriverError> {
        if !self.workload.is_session_being_sampled(&event.session_id) {
            debug!(
                session_id = %event.session_id,
                event_name = %event.name,
                "Dropping event of unsampled session"
            );
            return Ok(());
        }

        self.tx
            .send(event)
            .await
            .map_err(|_| DriverError::Generator("event channel closed".into()))
    }

    /// Signal that no more events will be submitted
    pub fn complete(self) {
        let _ = self.complete.send(());
    }
}

/// Turns template sessions into a timestamp-ordered event stream
pub struct TemplateGenerator {
    sessions: Vec<TemplateSession>,
    base: DateTime<Utc>,
    tick_duration: chrono::Duration,
}

impl TemplateGenerator {
    /// Tick `k` of the template maps to `base + k * tick_duration`
    pub fn new(
        sessions: Vec<TemplateSession>,
        base: DateTime<Utc>,
        tick_duration: chrono::Duration,
    ) -> Self {
        Self {
            sessions,
            base,
            tick_duration,
        }
    }

    fn offset_of(&self, ticks: u64) -> Result<chrono::Duration, DriverError> {
        i32::try_from(ticks)
            .ok()
            .and_then(|ticks| self.tick_duration.checked_mul(ticks))
            .ok_or_else(|| DriverError::Generator(format!("tick {} is out of range", ticks)))
    }

    fn timestamp_of(&self, tick: u64) -> Result<DateTime<Utc>, DriverError> {
        let offset = self.offset_of(tick)?;
        self.base.checked_add_signed(offset).ok_or_else(|| {
            DriverError::Generator(format!("tick {} lies past the representable time range", tick))
        })
    }

    /// All events of the template, in queue order
    pub fn events(&self) -> Result<Vec<Event>, DriverError> {
        let mut events = Vec::new();

        for session in &self.sessions {
            let max_resources = session.max_resource_request.clone().unwrap_or_default();
            let mut local_index = 0u64;
            let mut next_index = || {
                local_index += 1;
                local_index - 1
            };

            events.push(
                Event::new(
                    EventName::SessionReady,
                    &session.id,
                    self.timestamp_of(session.start_tick)?,
                )
                .with_local_index(next_index())
                .with_metadata(SessionMetadata {
                    max_resources: max_resources.clone(),
                    ..Default::default()
                }),
            );

            for training in &session.trainings {
                let metadata = SessionMetadata {
                    max_resources: max_resources.clone(),
                    current_resources: training.resources(),
                    gpu_utilizations: training.gpu_utilizations.clone(),
                    training_index: Some(training.index),
                };
                let duration = self.offset_of(training.duration_in_ticks)?;

                events.push(
                    Event::new(
                        EventName::TrainingStarted,
                        &session.id,
                        self.timestamp_of(training.start_tick)?,
                    )
                    .with_duration(duration)
                    .with_local_index(next_index())
                    .with_metadata(metadata.clone()),
                );
                events.push(
                    Event::new(
                        EventName::TrainingEnded,
                        &session.id,
                        self.timestamp_of(training.end_tick())?,
                    )
                    .with_duration(duration)
                    .with_local_index(next_index())
                    .with_metadata(metadata),
                );
            }

            events.push(
                Event::new(
                    EventName::SessionStopped,
                    &session.id,
                    self.timestamp_of(session.stop_tick)?,
                )
                .with_local_index(next_index())
                .with_metadata(SessionMetadata {
                    max_resources,
                    ..Default::default()
                }),
            );
        }

        events.sort_by_key(|e| (e.timestamp, e.name.tie_break_rank(), e.global_index));
        Ok(events)
    }
}

#[async_trait]
impl WorkloadGenerator for TemplateGenerator {
    async fn generate(&self, sink: EventSink) -> Result<(), DriverError> {
        let events = self.events()?;
        let total = events.len();

        for event in events {
            sink.submit_event(event).await?;
        }

        info!(
            num_sessions = self.sessions.len(),
            num_events = total,
            "Template generator submitted all events"
        );
        sink.complete();
        Ok(())
    }
}
