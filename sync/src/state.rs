//! Remote sync engine states.

use std::fmt;

/// Why the engine stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called
    Requested,
    /// A non-retryable error; only an explicit `start()` resumes syncing
    Fatal(String),
}

/// Lifecycle of the remote sync engine.
///
/// ```text
/// NotStarted -> PerformingBaseSync -> SyncingMutationsAndSubscribing
///                     ^                          |
///                     |                          v
///            SchedulingRestart  <---------  CleaningUp -> Stopped
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    NotStarted,
    PerformingBaseSync,
    SyncingMutationsAndSubscribing,
    CleaningUp,
    SchedulingRestart,
    Stopped(StopReason),
}

impl EngineState {
    pub fn can_transition_to(&self, next: &EngineState) -> bool {
        use EngineState::*;

        matches!(
            (self, next),
            (NotStarted, PerformingBaseSync)
                | (PerformingBaseSync, SyncingMutationsAndSubscribing)
                | (PerformingBaseSync, CleaningUp)
                | (SyncingMutationsAndSubscribing, CleaningUp)
                | (CleaningUp, SchedulingRestart)
                | (CleaningUp, Stopped(_))
                | (SchedulingRestart, PerformingBaseSync)
                | (SchedulingRestart, Stopped(_))
                | (Stopped(_), PerformingBaseSync)
        )
    }

    /// Whether background work is running or scheduled.
    pub fn is_active(&self) -> bool {
        !matches!(self, EngineState::NotStarted | EngineState::Stopped(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineState::Stopped(StopReason::Fatal(_)))
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::NotStarted => write!(f, "notStarted"),
            EngineState::PerformingBaseSync => write!(f, "performingBaseSync"),
            EngineState::SyncingMutationsAndSubscribing => {
                write!(f, "syncingMutationsAndSubscribing")
            }
            EngineState::CleaningUp => write!(f, "cleaningUp"),
            EngineState::SchedulingRestart => write!(f, "schedulingRestart"),
            EngineState::Stopped(StopReason::Requested) => write!(f, "stopped"),
            EngineState::Stopped(StopReason::Fatal(reason)) => write!(f, "stopped(fatal: {reason})"),
        }
    }
}
