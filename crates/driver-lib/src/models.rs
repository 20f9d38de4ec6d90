//! Core data models for the workload driver

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static GLOBAL_EVENT_INDEX: AtomicU64 = AtomicU64::new(0);

/// Names of the events a session goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventName {
    SessionReady,
    TrainingStarted,
    TrainingEnded,
    SessionStopped,
    UpdateGpuUtil,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::SessionReady => "session-ready",
            EventName::TrainingStarted => "training-started",
            EventName::TrainingEnded => "training-ended",
            EventName::SessionStopped => "session-stopped",
            EventName::UpdateGpuUtil => "update-gpu-util",
        }
    }

    /// Ordering among events sharing a timestamp.
    ///
    /// A session must exist before anything else happens to it, and a
    /// training must end before its session stops.
    pub(crate) fn tie_break_rank(&self) -> u8 {
        match self {
            EventName::SessionReady => 0,
            EventName::TrainingEnded => 1,
            EventName::UpdateGpuUtil => 2,
            EventName::TrainingStarted => 3,
            EventName::SessionStopped => 4,
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources requested by (or reserved for) a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub millicpus: f64,
    pub memory_mb: f64,
    pub gpus: u32,
    pub vram_gb: f64,
}

impl ResourceSpec {
    pub fn new(millicpus: f64, memory_mb: f64, gpus: u32, vram_gb: f64) -> Self {
        Self {
            millicpus,
            memory_mb,
            gpus,
            vram_gb,
        }
    }
}

/// Session metadata carried by events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub max_resources: ResourceSpec,
    pub current_resources: ResourceSpec,
    #[serde(default)]
    pub gpu_utilizations: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_index: Option<usize>,
}

/// A single simulated occurrence targeting one session
#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub name: EventName,
    pub session_id: String,
    /// Simulated time at which the event takes effect, including delays
    pub timestamp: DateTime<Utc>,
    pub original_timestamp: DateTime<Utc>,
    /// Simulated length of a training; zero for other events
    pub duration: chrono::Duration,
    pub local_index: u64,
    pub global_index: u64,
    pub metadata: SessionMetadata,
    total_delay: chrono::Duration,
    num_times_enqueued: u32,
}

impl Event {
    pub fn new(name: EventName, session_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let session_id = session_id.into();
        let global_index = GLOBAL_EVENT_INDEX.fetch_add(1, Ordering::Relaxed);

        Self {
            id: format!("{}-{}-{}", session_id, name, global_index),
            name,
            session_id,
            timestamp,
            original_timestamp: timestamp,
            duration: chrono::Duration::zero(),
            local_index: 0,
            global_index,
            metadata: SessionMetadata::default(),
            total_delay: chrono::Duration::zero(),
            num_times_enqueued: 0,
        }
    }

    pub fn with_duration(mut self, duration: chrono::Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_local_index(mut self, local_index: u64) -> Self {
        self.local_index = local_index;
        self
    }

    pub fn with_metadata(mut self, metadata: SessionMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Delay the event, moving its timestamp later by `amount`
    pub fn push_timestamp_back(&mut self, amount: chrono::Duration) {
        self.timestamp += amount;
        self.total_delay += amount;
    }

    pub fn total_delay(&self) -> chrono::Duration {
        self.total_delay
    }

    pub fn num_times_enqueued(&self) -> u32 {
        self.num_times_enqueued
    }

    pub(crate) fn mark_enqueued(&mut self) {
        self.num_times_enqueued += 1;
    }
}

/// Record of an event the workload has finished handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadEvent {
    pub event_id: String,
    pub session_id: String,
    pub name: EventName,
    pub timestamp: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkloadEvent {
    pub fn processed(event: &Event, name: EventName, error: Option<String>) -> Self {
        Self {
            event_id: event.id.clone(),
            session_id: event.session_id.clone(),
            name,
            timestamp: event.timestamp,
            processed_at: Utc::now(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_push_timestamp_back_tracks_delay() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut evt = Event::new(EventName::TrainingStarted, "s1", ts);

        evt.push_timestamp_back(chrono::Duration::seconds(30));
        evt.push_timestamp_back(chrono::Duration::seconds(90));

        assert_eq!(evt.timestamp, ts + chrono::Duration::seconds(120));
        assert_eq!(evt.original_timestamp, ts);
        assert_eq!(evt.total_delay(), chrono::Duration::seconds(120));
    }

    #[test]
    fn test_global_index_is_unique() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let a = Event::new(EventName::SessionReady, "s1", ts);
        let b = Event::new(EventName::SessionReady, "s1", ts);
        assert_ne!(a.global_index, b.global_index);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_event_name_serde() {
        let json = serde_json::to_string(&EventName::TrainingEnded).unwrap();
        assert_eq!(json, "\"training-ended\"");
        assert_eq!(EventName::SessionStopped.to_string(), "session-stopped");
    }
}
