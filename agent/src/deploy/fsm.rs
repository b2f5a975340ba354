//! Finite state machine for a deployment run

use crate::models::run::RunStatus;

/// Run event
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Host lock acquired, start forward steps
    Start,

    /// Every forward step succeeded
    AllStepsSucceeded,

    /// A forward step hard-failed (or the run was cancelled)
    StepFailed(String),

    /// Every rollback action succeeded or was skipped
    RollbackCompleted,

    /// At least one rollback action failed
    RollbackFailed(String),
}

/// Run FSM
#[derive(Debug, Clone)]
pub struct RunFsm {
    state: RunStatus,
    error: Option<String>,
}

impl RunFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self {
            state: RunStatus::Idle,
            error: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> RunStatus {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: RunEvent) -> Result<RunStatus, String> {
        let new_state = match (&self.state, &event) {
            (RunStatus::Idle, RunEvent::Start) => RunStatus::Running,

            (RunStatus::Running, RunEvent::AllStepsSucceeded) => RunStatus::Succeeded,
            (RunStatus::Running, RunEvent::StepFailed(err)) => {
                self.error = Some(err.clone());
                RunStatus::RollingBack
            }

            (RunStatus::RollingBack, RunEvent::RollbackCompleted) => RunStatus::RolledBack,
            (RunStatus::RollingBack, RunEvent::RollbackFailed(err)) => {
                self.error = Some(err.clone());
                RunStatus::RollbackFailed
            }

            // Terminal states accept nothing
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for RunFsm {
    fn default() -> Self {
        Self::new()
    }
}
