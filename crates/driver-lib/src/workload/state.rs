use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadState {
    Ready,
    Running,
    Pausing,
    Paused,
    Finished,
    Erred,
    Terminated,
}

impl WorkloadState {
    /// Running, or on its way into or out of a pause
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            WorkloadState::Running | WorkloadState::Pausing | WorkloadState::Paused
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkloadState::Finished | WorkloadState::Erred | WorkloadState::Terminated
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadState::Ready => "ready",
            WorkloadState::Running => "running",
            WorkloadState::Pausing => "pausing",
            WorkloadState::Paused => "paused",
            WorkloadState::Finished => "finished",
            WorkloadState::Erred => "erred",
            WorkloadState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
