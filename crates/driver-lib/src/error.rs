//! Error types for the workload-driving engine

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::EventName;
use crate::workload::{SessionState, WorkloadState};

/// Errors raised by a [`crate::clock::LogicalClock`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("cannot rewind clock from {current} to {requested}")]
    Rewind {
        current: DateTime<Utc>,
        requested: DateTime<Utc>,
    },

    #[error("cannot increment clock by a negative amount ({0})")]
    NegativeIncrement(chrono::Duration),

    #[error("clock arithmetic overflowed")]
    Overflow,
}

/// Errors raised by the [`crate::event_queue::EventQueue`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("no events are ready in the event queue")]
    Empty,
}

/// Returned by a tick trigger whose subscriber has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("tick subscriber is no longer receiving ticks")]
pub struct TickerClosed;

/// Lifecycle violations and registration problems for a workload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkloadError {
    #[error("workload is not running (state: {0})")]
    NotRunning(WorkloadState),

    #[error("workload is not paused (state: {0})")]
    NotPaused(WorkloadState),

    #[error("workload is not ready to start (state: {0})")]
    NotReady(WorkloadState),

    #[error("workload is already paused")]
    AlreadyPaused,

    #[error("workload is already unpaused")]
    AlreadyUnpaused,

    #[error("workload has already completed")]
    AlreadyCompleted,

    #[error("invalid workload state transition from {from} to {to}")]
    InvalidTransition {
        from: WorkloadState,
        to: WorkloadState,
    },

    #[error("invalid workload template: {0}")]
    InvalidTemplate(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session {session_id} cannot move from {from:?} to {to:?}")]
    InvalidSessionTransition {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },
}

/// Failures reported by the kernel/session backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("insufficient hosts available: {0}")]
    InsufficientCapacity(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("execution failed: {name}: {value}")]
    ExecutionFailed { name: String, value: String },

    #[error("kernel backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the workload driver and its session clients
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Ticker(#[from] TickerClosed),

    #[error(transparent)]
    Workload(#[from] WorkloadError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("client for session {session_id} received '{name}' as its first event")]
    InvalidFirstEvent { session_id: String, name: EventName },

    #[error("unknown or unexpected event type '{0}'")]
    UnknownEventType(EventName),

    #[error("session {session_id} did not report training start within {waited_ms}ms")]
    TrainingStartTimeout { session_id: String, waited_ms: u64 },

    #[error("session {session_id} did not report training end within {waited_ms}ms")]
    TrainingStopTimeout { session_id: String, waited_ms: u64 },

    #[error("event generator failed: {0}")]
    Generator(String),

    #[error("workload driver has already been started")]
    AlreadyStarted,

    #[error("{0} is required")]
    MissingComponent(&'static str),
}

/// Errors returned by the [`crate::manager::WorkloadManager`]
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("workload {0} is already registered")]
    DuplicateWorkload(String),

    #[error("unknown workload: {0}")]
    UnknownWorkload(String),

    #[error(transparent)]
    Workload(#[from] WorkloadError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl DriverError {
    /// Whether this error must abort the workload.
    ///
    /// Unknown sessions, unexpected event types, timeouts and lifecycle
    /// violations are reported but leave the workload running.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            DriverError::Kernel(KernelError::UnknownSession(_))
                | DriverError::Workload(_)
                | DriverError::UnknownEventType(_)
                | DriverError::TrainingStartTimeout { .. }
                | DriverError::TrainingStopTimeout { .. }
        )
    }
}
