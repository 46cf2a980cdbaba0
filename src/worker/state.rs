//! Worker run state machine.

use serde::{Deserialize, Serialize};

use crate::control::ControlCommand;
use crate::error::LifecycleError;

/// State of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Identity not yet registered.
    Starting,
    /// Consuming work.
    Running,
    /// Still polling for commands, not consuming work.
    Paused,
    /// Records removed, process about to exit.
    Terminated,
}

/// What the worker's own loop should do after a command was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Nothing changed.
    Continue,
    Pause,
    Resume,
    /// Drop the current work item and pick another.
    SkipCurrent,
    /// Use this model for future work.
    ChangeModel(String),
    /// Leave the loop and exit the process.
    Exit,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Starting, Running) | (Starting, Terminated) |
            (Running, Paused) | (Running, Terminated) |
            (Paused, Running) | (Paused, Terminated)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Whether commands are accepted in this state.
    pub fn accepts_commands(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Transition table for control commands.
    ///
    /// Returns the next state and the directive for the worker loop.
    /// Repeating `pause` while paused or `resume` while running is a no-op.
    pub fn apply(
        self,
        command: ControlCommand,
        args: &str,
    ) -> Result<(WorkerState, Directive), LifecycleError> {
        use WorkerState::*;

        if !self.accepts_commands() {
            return Err(LifecycleError::InvalidTransition {
                from: self.to_string(),
                command: command.to_string(),
            });
        }

        let next = match (self, command) {
            (Running, ControlCommand::Pause) => (Paused, Directive::Pause),
            (Paused, ControlCommand::Pause) => (Paused, Directive::Continue),
            (Paused, ControlCommand::Resume) => (Running, Directive::Resume),
            (Running, ControlCommand::Resume) => (Running, Directive::Continue),
            (_, ControlCommand::Cancel) => (Terminated, Directive::Exit),
            (state, ControlCommand::SkipCurrent) => (state, Directive::SkipCurrent),
            (state, ControlCommand::ChangeModel) => {
                (state, Directive::ChangeModel(args.trim().to_string()))
            }
            (state, _) => (state, Directive::Continue),
        };
        if next.0 != self && !self.can_transition_to(next.0) {
            return Err(LifecycleError::InvalidTransition {
                from: self.to_string(),
                command: command.to_string(),
            });
        }
        Ok(next)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}
