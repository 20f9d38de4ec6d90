use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::WorkloadState;
use crate::models::WorkloadEvent;

/// Most recent processed events kept on the statistics record
pub const MAX_PROCESSED_EVENT_RECORDS: usize = 4096;

/// Aggregate counters and histories for one workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub registered_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    pub session_creation_latencies_millis: Vec<u64>,
    pub session_termination_latencies_millis: Vec<u64>,
    pub exec_request_times_millis: Vec<u64>,
    pub training_start_latencies_millis: Vec<u64>,
    pub total_reply_latencies_millis: Vec<u64>,

    pub num_times_session_delayed_resource_contention: u64,
    pub cumulative_training_time_ticks: u64,
    pub aggregate_session_delay_millis: i64,

    pub current_tick: u64,
    pub num_active_sessions: i64,
    pub num_active_trainings: i64,
    pub num_discarded_sessions: u64,
    pub num_discarded_events: u64,
    pub num_events_processed: u64,
    pub num_sampled_sessions: u64,
    pub num_sessions_created: u64,
    /// Trainings submitted to the backend that have not started yet
    pub num_submitted_trainings: i64,
    pub num_tasks_executed: u64,
    pub sessions_sample_percentage: f64,
    pub tick_durations_millis: Vec<u64>,
    pub time_elapsed_millis: u64,
    pub time_spent_paused_millis: u64,
    pub total_num_sessions: usize,
    pub total_num_ticks: u64,
    pub workload_duration_millis: Option<u64>,
    pub workload_state: WorkloadState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub events_processed: VecDeque<WorkloadEvent>,
}

impl Statistics {
    pub fn new(sessions_sample_percentage: f64) -> Self {
        Self {
            registered_time: Utc::now(),
            start_time: None,
            end_time: None,
            session_creation_latencies_millis: Vec::new(),
            session_termination_latencies_millis: Vec::new(),
            exec_request_times_millis: Vec::new(),
            training_start_latencies_millis: Vec::new(),
            total_reply_latencies_millis: Vec::new(),
            num_times_session_delayed_resource_contention: 0,
            cumulative_training_time_ticks: 0,
            aggregate_session_delay_millis: 0,
            current_tick: 0,
            num_active_sessions: 0,
            num_active_trainings: 0,
            num_discarded_sessions: 0,
            num_discarded_events: 0,
            num_events_processed: 0,
            num_sampled_sessions: 0,
            num_sessions_created: 0,
            num_submitted_trainings: 0,
            num_tasks_executed: 0,
            sessions_sample_percentage,
            tick_durations_millis: Vec::new(),
            time_elapsed_millis: 0,
            time_spent_paused_millis: 0,
            total_num_sessions: 0,
            total_num_ticks: 0,
            workload_duration_millis: None,
            workload_state: WorkloadState::Ready,
            error_message: None,
            events_processed: VecDeque::new(),
        }
    }

    pub(crate) fn record_processed(&mut self, event: WorkloadEvent) {
        self.num_events_processed += 1;
        if self.events_processed.len() == MAX_PROCESSED_EVENT_RECORDS {
            self.events_processed.pop_front();
        }
        self.events_processed.push_back(event);
    }
}

/// Point-in-time view of a workload for external consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSnapshot {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub seed: u64,
    pub state: WorkloadState,
    pub statistics: Statistics,
}
