//! Error types for the pipeline orchestration core.
//!

use crate::messaging::MessagingError;
use crate::models::{TaskKind, TenantId};
use crate::state_machine::TaskState;
use crate::status_sink::StatusSinkError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Why an admission request was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    /// The tenant already created `count` tasks today against a quota of `quota`
    QuotaExceeded { count: u64, quota: u32 },
    /// The quota or today's count could not be read; admission fails closed
    QuotaUnavailable { message: String },
}

impl DenialReason {
    /// Quota reads that failed may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QuotaUnavailable { .. })
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaExceeded { count, quota } => {
                write!(f, "daily quota exceeded ({count}/{quota})")
            }
            Self::QuotaUnavailable { message } => write!(f, "quota unavailable: {message}"),
        }
    }
}

/// Errors surfaced to callers of the orchestrator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestrationError {
    /// Admission control refused the request; nothing was persisted
    #[error("Admission denied for tenant {tenant_id}: {reason}")]
    AdmissionDenied {
        tenant_id: TenantId,
        reason: DenialReason,
    },

    /// The task was persisted but its job could not be handed to a queue channel.
    /// The task stays `pending` and may be re-dispatched.
    #[error("Dispatch failed for task {task_id} on {kind} channel: {reason}")]
    DispatchFailure {
        task_id: Uuid,
        kind: TaskKind,
        reason: String,
    },

    /// A stage executor gave up on a task. Logged by the handler and recorded on the
    /// task as its error detail; never returned from dispatch.
    #[error("Stage execution failed for task {task_id}: {reason}")]
    StageExecution { task_id: Uuid, reason: String },

    /// The status sink could not be reached or rejected the operation
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The operation is not permitted from the task's current state
    #[error("Task {task_id} is {current_state}, cannot {operation}")]
    StatusConflict {
        task_id: Uuid,
        current_state: TaskState,
        operation: String,
    },

    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: Uuid },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl OrchestrationError {
    pub fn dispatch_failure(task_id: Uuid, kind: TaskKind, reason: impl Into<String>) -> Self {
        Self::DispatchFailure {
            task_id,
            kind,
            reason: reason.into(),
        }
    }

    pub fn stage_execution(task_id: Uuid, reason: impl Into<String>) -> Self {
        Self::StageExecution {
            task_id,
            reason: reason.into(),
        }
    }

    pub fn status_conflict(
        task_id: Uuid,
        current_state: TaskState,
        operation: impl Into<String>,
    ) -> Self {
        Self::StatusConflict {
            task_id,
            current_state,
            operation: operation.into(),
        }
    }

    /// Whether the caller may reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AdmissionDenied { reason, .. } => reason.is_retryable(),
            Self::DispatchFailure { .. } | Self::Persistence(_) => true,
            _ => false,
        }
    }
}

impl From<StatusSinkError> for OrchestrationError {
    fn from(err: StatusSinkError) -> Self {
        match err {
            StatusSinkError::NotFound { task_id } => Self::TaskNotFound { task_id },
            other => Self::Persistence(other.to_string()),
        }
    }
}

impl From<MessagingError> for OrchestrationError {
    fn from(err: MessagingError) -> Self {
        Self::Persistence(format!("messaging: {err}"))
    }
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denial_reason_display() {
        let reason = DenialReason::QuotaExceeded { count: 5, quota: 5 };
        assert_eq!(reason.to_string(), "daily quota exceeded (5/5)");
        assert!(!reason.is_retryable());

        let reason = DenialReason::QuotaUnavailable {
            message: "connection refused".to_string(),
        };
        assert!(reason.is_retryable());
    }

    #[test]
    fn test_sink_not_found_maps_to_task_not_found() {
        let task_id = Uuid::new_v4();
        let err: OrchestrationError = StatusSinkError::NotFound { task_id }.into();
        assert_eq!(err, OrchestrationError::TaskNotFound { task_id });
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let task_id = Uuid::new_v4();
        let err = OrchestrationError::dispatch_failure(task_id, TaskKind::Acquire, "no handler");
        let display = err.to_string();
        assert!(display.contains("Dispatch failed"));
        assert!(display.contains("acquire"));
        assert!(err.is_retryable());

        let err = OrchestrationError::status_conflict(task_id, TaskState::Running, "delete");
        assert!(err.to_string().contains("running, cannot delete"));
    }
}
