use super::states::TaskState;
use thiserror::Error;

/// Reasons a status update is refused
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("Task is in terminal state {state}; no further transitions allowed")]
    TerminalState { state: TaskState },

    #[error("Invalid progress value: {value}")]
    InvalidProgress { value: f64 },
}

impl StateMachineError {
    /// Terminal-state rejections are expected races (e.g. a cancel landing while a
    /// handler is finishing), not defects.
    pub fn is_terminal_rejection(&self) -> bool {
        matches!(self, Self::TerminalState { .. })
    }
}

/// Result type alias for state machine operations
pub type StateMachineResult<T> = Result<T, StateMachineError>;
