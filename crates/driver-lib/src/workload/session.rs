use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkloadError;
use crate::models::ResourceSpec;

/// Lifecycle of a simulated session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingStart,
    Idle,
    Training,
    Stopped,
    Erred,
    Discarded,
}

impl SessionState {
    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (AwaitingStart, Idle) | (AwaitingStart, Discarded) => true,
            (Idle, Training) | (Training, Idle) => true,
            (Stopped, _) | (Discarded, _) => false,
            (_, Stopped) | (_, Erred) => true,
            _ => false,
        }
    }
}

/// Largest tick a template may reference; tick offsets are scaled as `i32`
pub const MAX_TEMPLATE_TICK: u64 = i32::MAX as u64;

/// One training inside a workload template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingEvent {
    pub index: usize,
    pub millicpus: f64,
    pub mem_mb: f64,
    pub vram_gb: f64,
    #[serde(default)]
    pub gpu_utilizations: Vec<f64>,
    pub start_tick: u64,
    pub duration_in_ticks: u64,
}

impl TrainingEvent {
    pub fn num_gpus(&self) -> u32 {
        self.gpu_utilizations.iter().filter(|u| **u > 0.0).count() as u32
    }

    pub fn resources(&self) -> ResourceSpec {
        ResourceSpec::new(self.millicpus, self.mem_mb, self.num_gpus(), self.vram_gb)
    }

    /// Saturates instead of overflowing; validation rejects the result
    pub fn end_tick(&self) -> u64 {
        self.start_tick.saturating_add(self.duration_in_ticks)
    }
}

/// A session as described by a workload template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSession {
    pub id: String,
    pub start_tick: u64,
    pub stop_tick: u64,
    #[serde(default)]
    pub trainings: Vec<TrainingEvent>,
    pub max_resource_request: Option<ResourceSpec>,
}

impl TemplateSession {
    pub(crate) fn validate(&self) -> Result<(), WorkloadError> {
        if self.max_resource_request.is_none() {
            return Err(WorkloadError::InvalidTemplate(format!(
                "session {} has no max resource request",
                self.id
            )));
        }
        if self.stop_tick < self.start_tick {
            return Err(WorkloadError::InvalidTemplate(format!(
                "session {} stops (tick {}) before it starts (tick {})",
                self.id, self.stop_tick, self.start_tick
            )));
        }
        if self.stop_tick > MAX_TEMPLATE_TICK {
            return Err(WorkloadError::InvalidTemplate(format!(
                "session {} stops at tick {}, past the last supported tick {}",
                self.id, self.stop_tick, MAX_TEMPLATE_TICK
            )));
        }
        for training in &self.trainings {
            if training.start_tick < self.start_tick || training.end_tick() > self.stop_tick {
                return Err(WorkloadError::InvalidTemplate(format!(
                    "training {} of session {} falls outside ticks {}..={}",
                    training.index, self.id, self.start_tick, self.stop_tick
                )));
            }
        }
        Ok(())
    }
}

/// Runtime view of a session owned by a workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub max_resources: ResourceSpec,
    pub current_resources: ResourceSpec,
    pub state: SessionState,
    pub trainings_completed: u64,
    pub num_trainings: usize,
    pub created_at: Option<DateTime<Utc>>,
    pub training_started_at: Option<DateTime<Utc>>,
    pub total_delay_millis: i64,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, max_resources: ResourceSpec) -> Self {
        Self {
            id: id.into(),
            max_resources,
            current_resources: ResourceSpec::default(),
            state: SessionState::AwaitingStart,
            trainings_completed: 0,
            num_trainings: 0,
            created_at: None,
            training_started_at: None,
            total_delay_millis: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub(crate) fn from_template(template: &TemplateSession) -> Self {
        let mut session = Self::new(
            template.id.clone(),
            template.max_resource_request.clone().unwrap_or_default(),
        );
        session.num_trainings = template.trainings.len();
        session
    }

    /// Move to `next`; invalid transitions leave the session untouched
    pub fn set_state(&mut self, next: SessionState) -> Result<(), WorkloadError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(WorkloadError::InvalidSessionTransition {
                session_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(start: u64, stop: u64, trainings: Vec<(u64, u64)>) -> TemplateSession {
        TemplateSession {
            id: "s1".into(),
            start_tick: start,
            stop_tick: stop,
            trainings: trainings
                .into_iter()
                .enumerate()
                .map(|(index, (start_tick, duration_in_ticks))| TrainingEvent {
                    index,
                    millicpus: 100.0,
                    mem_mb: 256.0,
                    vram_gb: 1.0,
                    gpu_utilizations: vec![50.0, 0.0],
                    start_tick,
                    duration_in_ticks,
                })
                .collect(),
            max_resource_request: Some(ResourceSpec::new(1000.0, 2048.0, 2, 8.0)),
        }
    }

    #[test]
    fn test_template_validation() {
        assert!(template(1, 10, vec![(2, 3)]).validate().is_ok());
        assert!(template(5, 4, vec![]).validate().is_err());
        assert!(template(1, 10, vec![(8, 5)]).validate().is_err());

        let mut missing = template(1, 10, vec![]);
        missing.max_resource_request = None;
        assert!(missing.validate().is_err());
    }

    #[test]
    fn test_ticks_past_supported_range_rejected() {
        let far = MAX_TEMPLATE_TICK + 10;
        let result = template(far, far + 5, vec![]).validate();
        assert!(matches!(result, Err(WorkloadError::InvalidTemplate(_))));

        assert!(template(0, MAX_TEMPLATE_TICK, vec![(1, 2)]).validate().is_ok());
    }

    #[test]
    fn test_overlong_training_rejected_without_overflow() {
        let training = template(1, 10, vec![(2, u64::MAX)]);
        assert_eq!(training.trainings[0].end_tick(), u64::MAX);
        assert!(matches!(
            training.validate(),
            Err(WorkloadError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_training_gpu_count() {
        let t = &template(1, 10, vec![(2, 3)]).trainings[0];
        assert_eq!(t.num_gpus(), 1);
        assert_eq!(t.resources().gpus, 1);
        assert_eq!(t.end_tick(), 5);
    }

    #[test]
    fn test_session_transitions() {
        let mut session = Session::from_template(&template(1, 10, vec![(2, 3)]));
        assert_eq!(session.num_trainings, 1);

        session.set_state(SessionState::Idle).unwrap();
        session.set_state(SessionState::Training).unwrap();
        session.set_state(SessionState::Idle).unwrap();
        session.set_state(SessionState::Stopped).unwrap();

        assert!(session.set_state(SessionState::Training).is_err());
        assert_eq!(session.state, SessionState::Stopped);
    }
}
