//! # Status Sink
//!
//! The persistence seam for task lifecycle state. The orchestrator and stage handlers
//! never talk to a database directly; they go through [`StatusSink`], which is the
//! single source of truth for task status.
//!
//! Implementations must route every status mutation through
//! [`TaskStateMachine::apply`](crate::state_machine::TaskStateMachine::apply) so that
//! terminal states stay immutable and progress stays monotone regardless of backend.
//!
//! - [`InMemoryStatusSink`]: process-local store used by tests and embedded setups
//! - [`PgStatusSink`]: PostgreSQL-backed store (see `migrations/`)

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::models::{NewTask, Task, TaskStatusUpdate, TenantId};
use crate::state_machine::StateMachineError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use thiserror::Error;
use uuid::Uuid;

pub use in_memory::InMemoryStatusSink;
#[cfg(feature = "postgres")]
pub use postgres::PgStatusSink;

/// Status sink failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatusSinkError {
    #[error("Task {task_id} not found")]
    NotFound { task_id: Uuid },

    #[error("Update rejected for task {task_id}: {source}")]
    TransitionRejected {
        task_id: Uuid,
        #[source]
        source: StateMachineError,
    },

    #[error("Status sink unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl StatusSinkError {
    /// Rejection because the task already reached a terminal state
    pub fn is_terminal_rejection(&self) -> bool {
        matches!(
            self,
            Self::TransitionRejected { source, .. } if source.is_terminal_rejection()
        )
    }
}

impl From<sqlx::Error> for StatusSinkError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StatusSinkError::Unavailable(err.to_string())
            }
            _ => StatusSinkError::Database(err.to_string()),
        }
    }
}

pub type StatusSinkResult<T> = Result<T, StatusSinkError>;

/// Persistence contract consumed by the orchestration core
#[async_trait]
pub trait StatusSink: Send + Sync + 'static {
    /// Persist a new `pending` task
    async fn create_task(&self, new_task: NewTask) -> StatusSinkResult<Task>;

    /// Persist a new task only if the tenant has created fewer than `quota` tasks
    /// today, checked and inserted atomically. Returns `None` when over quota.
    async fn create_task_within_quota(
        &self,
        new_task: NewTask,
        quota: u32,
    ) -> StatusSinkResult<Option<Task>>;

    /// Apply a status transition, returning the updated record
    async fn update_status(
        &self,
        task_id: Uuid,
        update: TaskStatusUpdate,
    ) -> StatusSinkResult<Task>;

    async fn get_task(&self, task_id: Uuid) -> StatusSinkResult<Task>;

    /// Record `job_id` as the task's outstanding job. Succeeds only while the task is
    /// `pending` with no job recorded, and returns `false` otherwise.
    async fn claim_dispatch(&self, task_id: Uuid, job_id: Uuid) -> StatusSinkResult<bool>;

    /// Clear the recorded job if it is still `job_id`
    async fn release_dispatch(&self, task_id: Uuid, job_id: Uuid) -> StatusSinkResult<()>;

    /// Tasks admitted for the tenant since 00:00 UTC today. Chained tasks are not
    /// admissions and are excluded.
    async fn count_tasks_today(&self, tenant_id: &TenantId) -> StatusSinkResult<u64>;

    /// Configured daily quota for the tenant, if any
    async fn get_quota(&self, tenant_id: &TenantId) -> StatusSinkResult<Option<u32>>;

    /// Remove a task record. Callers are responsible for the terminal-state check.
    async fn delete_task(&self, task_id: Uuid) -> StatusSinkResult<()>;
}

/// Start of the calendar day (UTC) containing `now`
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::TaskState;

    #[test]
    fn test_start_of_day() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 17, 42, 9).unwrap();
        let start = start_of_day(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_terminal_rejection_detection() {
        let err = StatusSinkError::TransitionRejected {
            task_id: Uuid::new_v4(),
            source: StateMachineError::TerminalState {
                state: TaskState::Cancelled,
            },
        };
        assert!(err.is_terminal_rejection());
        assert!(!StatusSinkError::Unavailable("down".to_string()).is_terminal_rejection());
    }
}
