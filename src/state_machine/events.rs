use super::states::TaskState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events that can trigger task state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TaskEvent {
    /// First handler invocation picked the job up
    Start,
    /// Stage executor reported a progress fraction
    Progress(f64),
    /// Handler returned successfully, with the executor's output
    Complete(Option<Value>),
    /// Handler failed and no retry will follow
    Fail(String),
    /// Explicit cancellation request
    Cancel,
}

impl TaskEvent {
    /// The state this event moves a task into
    pub fn target_state(&self) -> TaskState {
        match self {
            Self::Start | Self::Progress(_) => TaskState::Running,
            Self::Complete(_) => TaskState::Completed,
            Self::Fail(_) => TaskState::Failed,
            Self::Cancel => TaskState::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.target_state().is_terminal()
    }

    /// Create a failure event with the given error message
    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}
