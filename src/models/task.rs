//! # Task Model
//!
//! The unit of orchestrated work. A task is created by the orchestrator on admission
//! and afterwards mutated only through [`TaskStatusUpdate`]s applied by a status sink.

use crate::state_machine::{TaskEvent, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Tenant identifier; opaque to the core
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Which pipeline stage a task targets. Each kind has its own queue channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Fetch media from a source
    Acquire,
    /// Transform acquired media
    Transform,
    /// Deliver transformed media to a destination
    Deliver,
    /// Acquire, transform and deliver within a single job
    Composite,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Acquire,
        TaskKind::Transform,
        TaskKind::Deliver,
        TaskKind::Composite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquire => "acquire",
            Self::Transform => "transform",
            Self::Deliver => "deliver",
            Self::Composite => "composite",
        }
    }

    /// The stage that follows this one when a task auto-advances
    pub fn next_stage(&self) -> Option<TaskKind> {
        match self {
            Self::Acquire => Some(Self::Transform),
            Self::Transform => Some(Self::Deliver),
            Self::Deliver | Self::Composite => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "acquire" => Ok(Self::Acquire),
            "transform" => Ok(Self::Transform),
            "deliver" => Ok(Self::Deliver),
            "composite" => Ok(Self::Composite),
            _ => Err(format!("Invalid task kind: {s}")),
        }
    }
}

/// Persisted task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub tenant_id: TenantId,
    pub kind: TaskKind,
    pub status: TaskState,
    /// Fraction complete in `[0.0, 1.0]`
    pub progress: f64,
    pub source_spec: Value,
    pub target_spec: Value,
    pub processing_spec: Value,
    /// Present only when `status` is `failed`
    pub error_detail: Option<String>,
    /// Result returned by the stage executor on completion
    pub output: Option<Value>,
    /// Task whose completion created this one through auto-advance
    pub origin_task_id: Option<Uuid>,
    /// Admitted task at the head of an auto-advance chain; `None` for admitted tasks
    pub root_task_id: Option<Uuid>,
    /// The one job handed to a channel for this task, if any
    pub dispatched_job_id: Option<Uuid>,
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Handler invocations recorded so far
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether successful completion should enqueue the next stage
    pub fn auto_advance(&self) -> bool {
        auto_advance_requested(&self.processing_spec)
    }

    /// Id shared by every task in the same auto-advance chain
    pub fn correlation_id(&self) -> Uuid {
        self.root_task_id.unwrap_or(self.task_id)
    }

    /// Whether a job for this task is already with a channel
    pub fn is_dispatched(&self) -> bool {
        self.dispatched_job_id.is_some()
    }
}

/// Reads the `auto_advance` flag from a processing spec. This is the only field of
/// the stage specs the core looks at.
pub fn auto_advance_requested(processing_spec: &Value) -> bool {
    processing_spec
        .get("auto_advance")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// New task for insertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub tenant_id: TenantId,
    pub kind: TaskKind,
    pub source_spec: Value,
    pub target_spec: Value,
    pub processing_spec: Value,
    pub origin_task_id: Option<Uuid>,
    pub root_task_id: Option<Uuid>,
}

impl NewTask {
    pub fn new(tenant_id: impl Into<TenantId>, kind: TaskKind) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            kind,
            source_spec: Value::Null,
            target_spec: Value::Null,
            processing_spec: Value::Null,
            origin_task_id: None,
            root_task_id: None,
        }
    }

    pub fn with_source_spec(mut self, spec: Value) -> Self {
        self.source_spec = spec;
        self
    }

    pub fn with_target_spec(mut self, spec: Value) -> Self {
        self.target_spec = spec;
        self
    }

    pub fn with_processing_spec(mut self, spec: Value) -> Self {
        self.processing_spec = spec;
        self
    }

    /// Next stage of `predecessor`, keeping its chain's root
    pub fn chained_from(mut self, predecessor: &Task) -> Self {
        self.origin_task_id = Some(predecessor.task_id);
        self.root_task_id = Some(predecessor.correlation_id());
        self
    }

    /// Materialize a `pending` task with a fresh id
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            task_id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            kind: self.kind,
            status: TaskState::Pending,
            progress: 0.0,
            source_spec: self.source_spec,
            target_spec: self.target_spec,
            processing_spec: self.processing_spec,
            error_detail: None,
            output: None,
            origin_task_id: self.origin_task_id,
            root_task_id: self.root_task_id,
            dispatched_job_id: None,
            dispatched_at: None,
            attempts: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

/// A requested status mutation, as accepted by `StatusSink::update_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub status: TaskState,
    pub progress: Option<f64>,
    pub error_detail: Option<String>,
    pub output: Option<Value>,
    /// Handler attempt number, recorded on the task when larger than the current count
    pub attempt: Option<u32>,
}

impl TaskStatusUpdate {
    pub fn new(status: TaskState) -> Self {
        Self {
            status,
            progress: None,
            error_detail: None,
            output: None,
            attempt: None,
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

impl From<TaskEvent> for TaskStatusUpdate {
    fn from(event: TaskEvent) -> Self {
        match event {
            TaskEvent::Start => TaskStatusUpdate::new(TaskState::Running).with_progress(0.0),
            TaskEvent::Progress(fraction) => {
                TaskStatusUpdate::new(TaskState::Running).with_progress(fraction)
            }
            TaskEvent::Complete(output) => TaskStatusUpdate {
                output,
                ..TaskStatusUpdate::new(TaskState::Completed).with_progress(1.0)
            },
            TaskEvent::Fail(message) => TaskStatusUpdate {
                error_detail: Some(message),
                ..TaskStatusUpdate::new(TaskState::Failed)
            },
            TaskEvent::Cancel => TaskStatusUpdate::new(TaskState::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_chain() {
        assert_eq!(TaskKind::Acquire.next_stage(), Some(TaskKind::Transform));
        assert_eq!(TaskKind::Transform.next_stage(), Some(TaskKind::Deliver));
        assert_eq!(TaskKind::Deliver.next_stage(), None);
        assert_eq!(TaskKind::Composite.next_stage(), None);
    }

    #[test]
    fn test_kind_string_conversion() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
        assert!("upload".parse::<TaskKind>().is_err());
        assert_eq!(serde_json::to_string(&TaskKind::Deliver).unwrap(), "\"deliver\"");
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = NewTask::new("tenant-a", TaskKind::Acquire)
            .with_source_spec(json!({"url": "https://example.com/video"}))
            .into_task(Utc::now());

        assert_eq!(task.status, TaskState::Pending);
        assert_eq!(task.progress, 0.0);
        assert_eq!(task.attempts, 0);
        assert!(task.started_at.is_none());
        assert!(task.origin_task_id.is_none());
        assert_eq!(task.tenant_id.as_str(), "tenant-a");
    }

    #[test]
    fn test_chain_keeps_root() {
        let acquire = NewTask::new("tenant-a", TaskKind::Acquire).into_task(Utc::now());
        assert_eq!(acquire.correlation_id(), acquire.task_id);

        let transform = NewTask::new("tenant-a", TaskKind::Transform)
            .chained_from(&acquire)
            .into_task(Utc::now());
        let deliver = NewTask::new("tenant-a", TaskKind::Deliver)
            .chained_from(&transform)
            .into_task(Utc::now());

        assert_eq!(deliver.origin_task_id, Some(transform.task_id));
        assert_eq!(deliver.root_task_id, Some(acquire.task_id));
        assert_eq!(deliver.correlation_id(), acquire.task_id);
        assert!(!deliver.is_dispatched());
    }

    #[test]
    fn test_auto_advance_flag() {
        assert!(auto_advance_requested(&json!({"auto_advance": true})));
        assert!(!auto_advance_requested(&json!({"auto_advance": "yes"})));
        assert!(!auto_advance_requested(&json!({})));
        assert!(!auto_advance_requested(&Value::Null));
    }

    #[test]
    fn test_update_from_events() {
        let update = TaskStatusUpdate::from(TaskEvent::Complete(Some(json!({"path": "/out"}))));
        assert_eq!(update.status, TaskState::Completed);
        assert_eq!(update.progress, Some(1.0));
        assert!(update.output.is_some());

        let update = TaskStatusUpdate::from(TaskEvent::Fail("boom".to_string()));
        assert_eq!(update.status, TaskState::Failed);
        assert_eq!(update.error_detail.as_deref(), Some("boom"));
        assert_eq!(update.progress, None);
    }
}
