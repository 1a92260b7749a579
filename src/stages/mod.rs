//! # Stage Executors
//!
//! The pluggable units that actually acquire, transform and deliver media. Executors
//! know nothing about queues, retries or task status; they receive a [`StagePayload`]
//! plus a [`StageContext`] and return a [`StageOutput`] or a [`StageError`].
//!
//! Executors should poll [`StageContext::is_cancelled`] (or await
//! [`StageContext::cancelled`]) at convenient points; cancellation is cooperative and
//! the core never aborts a running executor.

pub mod composite;
pub mod progress;

pub use composite::CompositeExecutor;
pub use progress::{ProgressReporter, ProgressUpdate};

pub use crate::messaging::StagePayload;

use crate::models::{TaskKind, TenantId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Result data produced by a stage; becomes `Task::output`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub data: Value,
}

impl StageOutput {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn into_value(self) -> Option<Value> {
        match self.data {
            Value::Null => None,
            data => Some(data),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    /// Transient failure; the broker may deliver the job again
    #[error("{0}")]
    Retryable(String),

    /// Failure that another attempt will not fix
    #[error("{0}")]
    Permanent(String),

    #[error("stage cancelled")]
    Cancelled,
}

impl StageError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Per-invocation context handed to an executor
#[derive(Debug, Clone)]
pub struct StageContext {
    pub task_id: Uuid,
    pub tenant_id: TenantId,
    pub kind: TaskKind,
    /// 1-based delivery attempt
    pub attempt: u32,
    pub progress: ProgressReporter,
    pub cancellation: CancellationToken,
}

impl StageContext {
    pub fn report_progress(&self, fraction: f64, note: Option<&str>) {
        self.progress.report(fraction, note);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the task has been cancelled
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Context for one step of a multi-stage run, with progress mapped into
    /// `[offset, offset + span]`
    pub fn for_substage(&self, kind: TaskKind, offset: f64, span: f64) -> Self {
        Self {
            kind,
            progress: self.progress.scoped(offset, span),
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait StageExecutor: Send + Sync + 'static {
    async fn run(&self, payload: StagePayload, ctx: StageContext) -> Result<StageOutput, StageError>;

    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Executors by task kind, fixed at startup
#[derive(Clone, Default)]
pub struct StageExecutors {
    executors: HashMap<TaskKind, Arc<dyn StageExecutor>>,
}

impl StageExecutors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: TaskKind, executor: Arc<dyn StageExecutor>) -> Self {
        self.executors.insert(kind, executor);
        self
    }

    pub fn register(&mut self, kind: TaskKind, executor: Arc<dyn StageExecutor>) {
        self.executors.insert(kind, executor);
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&kind).cloned()
    }

    /// Fill in a [`CompositeExecutor`] when no explicit composite executor was
    /// registered but all three single stages were
    pub fn with_derived_composite(mut self) -> Self {
        if self.executors.contains_key(&TaskKind::Composite) {
            return self;
        }
        if let (Some(acquire), Some(transform), Some(deliver)) = (
            self.get(TaskKind::Acquire),
            self.get(TaskKind::Transform),
            self.get(TaskKind::Deliver),
        ) {
            self.executors.insert(
                TaskKind::Composite,
                Arc::new(CompositeExecutor::new(acquire, transform, deliver)),
            );
        }
        self
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.executors.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for StageExecutors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageExecutors")
            .field("kinds", &self.kinds())
            .finish()
    }
}
