//! # Stage Job Handler
//!
//! Wraps a [`StageExecutor`] with task lifecycle bookkeeping. The same handler runs
//! jobs delivered by a queue worker and jobs executed inline in fallback mode:
//!
//! 1. `pending -> running` (progress 0) on the first invocation
//! 2. executor progress is forwarded to the status sink while it runs
//! 3. success: `running -> completed` (progress 1), then the completion listener
//! 4. failure: `running -> failed`, unless the retry policy schedules another attempt
//!
//! A job whose id differs from the task's recorded `dispatched_job_id` is stale and is
//! skipped. Status-update failures are logged; the job still counts as run.

use crate::constants::operations;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::logging::{log_error, log_task_operation};
use crate::messaging::JobMessage;
use crate::models::{Task, TaskKind, TaskStatusUpdate};
use crate::queue::cancellation::CancellationRegistry;
use crate::queue::retry::{RetryDecision, RetryPolicy};
use crate::stages::{ProgressReporter, ProgressUpdate, StageContext, StageError, StageExecutor};
use crate::state_machine::{TaskEvent, TaskState};
use crate::status_sink::{StatusSink, StatusSinkError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Notified after a task completes successfully
#[async_trait]
pub trait CompletionListener: Send + Sync + 'static {
    /// `job` is the job that completed `task`. An error is reported on the handler
    /// outcome; the task itself stays completed.
    async fn on_completed(&self, task: &Task, job: &JobMessage) -> OrchestrationResult<()>;
}

/// How the job reached the handler
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryContext {
    /// 1-based attempt number
    pub attempt: u32,
    /// Policy the broker will apply on failure; `None` means no further attempt
    pub retry_policy: Option<RetryPolicy>,
}

impl DeliveryContext {
    /// Inline execution: one attempt, no retries
    pub fn inline() -> Self {
        Self {
            attempt: 1,
            retry_policy: None,
        }
    }

    pub fn broker(attempt: u32, retry_policy: RetryPolicy) -> Self {
        Self {
            attempt,
            retry_policy: Some(retry_policy),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Completed {
        task: Option<Task>,
        /// Completion listener failure, e.g. the next stage could not be dispatched
        follow_up_error: Option<String>,
    },
    /// Attempt failed; the broker should redeliver after `delay`
    Retry { delay: Duration, error: String },
    Failed { error: String },
    Cancelled,
    /// Nothing to do: the task is gone or already terminal
    Skipped { reason: String },
}

impl HandlerOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Whether the job message can be acknowledged
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Retry { .. })
    }
}

pub struct StageJobHandler {
    kind: TaskKind,
    executor: Arc<dyn StageExecutor>,
    sink: Arc<dyn StatusSink>,
    cancellations: CancellationRegistry,
    listener: Option<Arc<dyn CompletionListener>>,
}

impl StageJobHandler {
    pub fn new(
        kind: TaskKind,
        executor: Arc<dyn StageExecutor>,
        sink: Arc<dyn StatusSink>,
        cancellations: CancellationRegistry,
    ) -> Self {
        Self {
            kind,
            executor,
            sink,
            cancellations,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn CompletionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Run one delivery of `job`
    #[instrument(skip(self, job, delivery), fields(task_id = %job.task_id, kind = %self.kind, attempt = delivery.attempt))]
    pub async fn handle(&self, job: &JobMessage, delivery: DeliveryContext) -> HandlerOutcome {
        let task_id = job.task_id;
        let token = self.cancellations.register(task_id);
        let outcome = self.run_registered(job, &delivery, token).await;
        self.cancellations.remove(task_id);

        log_task_operation(
            operations::HANDLE_JOB,
            Some(task_id),
            Some(self.kind),
            outcome_label(&outcome),
            Some(&format!("attempt {}", delivery.attempt)),
        );
        outcome
    }

    /// Mark the task failed without running the executor, used when a redelivered
    /// job has already used up its attempts
    pub async fn abandon(&self, job: &JobMessage, reason: &str) -> HandlerOutcome {
        // failed is only reachable from running
        if let Err(e) = self
            .sink
            .update_status(job.task_id, TaskStatusUpdate::new(TaskState::Running))
            .await
        {
            if !e.is_terminal_rejection() {
                warn!(task_id = %job.task_id, error = %e, "Failed to mark abandoned task running");
            }
        }

        match self
            .sink
            .update_status(job.task_id, TaskEvent::fail_with_error(reason).into())
            .await
        {
            Ok(_) => HandlerOutcome::Failed {
                error: reason.to_string(),
            },
            Err(e) => self.skip_or_log(job.task_id, "abandon", e, || HandlerOutcome::Failed {
                error: reason.to_string(),
            }),
        }
    }

    async fn run_registered(
        &self,
        job: &JobMessage,
        delivery: &DeliveryContext,
        token: tokio_util::sync::CancellationToken,
    ) -> HandlerOutcome {
        let task_id = job.task_id;

        match self.sink.get_task(task_id).await {
            Ok(task) if task.is_terminal() => {
                return HandlerOutcome::Skipped {
                    reason: format!("task already {}", task.status),
                };
            }
            Ok(Task {
                dispatched_job_id: Some(current),
                ..
            }) if current != job.job_id => {
                warn!(task_id = %task_id, job_id = %job.job_id, current_job_id = %current, "Stale job for task, skipping");
                return HandlerOutcome::Skipped {
                    reason: format!("superseded by job {current}"),
                };
            }
            Ok(_) => {}
            Err(StatusSinkError::NotFound { .. }) => {
                return HandlerOutcome::Skipped {
                    reason: "task not found".to_string(),
                };
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "Could not read task before running"),
        }

        if token.is_cancelled() {
            return HandlerOutcome::Cancelled;
        }

        let start = TaskStatusUpdate::from(TaskEvent::Start).with_attempt(delivery.attempt);
        if let Err(e) = self.sink.update_status(task_id, start).await {
            if e.is_terminal_rejection() {
                return HandlerOutcome::Skipped {
                    reason: "task reached a terminal state".to_string(),
                };
            }
            warn!(task_id = %task_id, error = %e, "Failed to record task start");
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
        let ctx = StageContext {
            task_id,
            tenant_id: job.tenant_id.clone(),
            kind: self.kind,
            attempt: delivery.attempt,
            progress: ProgressReporter::new(task_id, tx),
            cancellation: token.clone(),
        };

        debug!(executor = self.executor.name(), "Running stage executor");
        let run = self.executor.run(job.payload.clone(), ctx);
        tokio::pin!(run);
        let result = loop {
            tokio::select! {
                biased;
                result = &mut run => break result,
                Some(update) = rx.recv() => self.record_progress(update).await,
            }
        };
        while let Ok(update) = rx.try_recv() {
            self.record_progress(update).await;
        }

        if token.is_cancelled() {
            info!(task_id = %task_id, "Stage finished after cancellation");
            return HandlerOutcome::Cancelled;
        }

        match result {
            Ok(output) => self.complete(job, output.into_value()).await,
            Err(StageError::Cancelled) => HandlerOutcome::Cancelled,
            Err(err) => self.fail(task_id, delivery, err).await,
        }
    }

    async fn record_progress(&self, update: ProgressUpdate) {
        let status = TaskStatusUpdate::from(TaskEvent::Progress(update.fraction));
        match self.sink.update_status(update.task_id, status).await {
            Ok(_) => {}
            Err(e) if e.is_terminal_rejection() => {
                debug!(task_id = %update.task_id, "Progress ignored for terminal task")
            }
            Err(e) => warn!(task_id = %update.task_id, error = %e, "Failed to record progress"),
        }
    }

    async fn complete(&self, job: &JobMessage, output: Option<serde_json::Value>) -> HandlerOutcome {
        let task_id = job.task_id;
        match self
            .sink
            .update_status(task_id, TaskEvent::Complete(output).into())
            .await
        {
            Ok(task) => {
                let follow_up_error = match &self.listener {
                    Some(listener) => listener.on_completed(&task, job).await.err(),
                    None => None,
                };
                HandlerOutcome::Completed {
                    task: Some(task),
                    follow_up_error: follow_up_error.map(|e| e.to_string()),
                }
            }
            Err(e) => self.skip_or_log(task_id, "complete", e, || HandlerOutcome::Completed {
                task: None,
                follow_up_error: None,
            }),
        }
    }

    async fn fail(&self, task_id: Uuid, delivery: &DeliveryContext, err: StageError) -> HandlerOutcome {
        let decision = delivery
            .retry_policy
            .as_ref()
            .map(|policy| policy.decide(delivery.attempt, &err))
            .unwrap_or(RetryDecision::GiveUp);

        match decision {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    task_id = %task_id,
                    attempt = delivery.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "🔁 Stage attempt failed, retry scheduled"
                );
                HandlerOutcome::Retry {
                    delay,
                    error: err.to_string(),
                }
            }
            RetryDecision::GiveUp => {
                let error = err.to_string();
                log_error(
                    "stage_job_handler",
                    operations::HANDLE_JOB,
                    &OrchestrationError::stage_execution(task_id, error.clone()).to_string(),
                    Some(&format!("attempt {}", delivery.attempt)),
                );
                match self
                    .sink
                    .update_status(task_id, TaskEvent::fail_with_error(error.clone()).into())
                    .await
                {
                    Ok(_) => HandlerOutcome::Failed { error },
                    Err(e) => {
                        self.skip_or_log(task_id, "fail", e, || HandlerOutcome::Failed { error })
                    }
                }
            }
        }
    }

    fn skip_or_log(
        &self,
        task_id: Uuid,
        operation: &str,
        err: StatusSinkError,
        otherwise: impl FnOnce() -> HandlerOutcome,
    ) -> HandlerOutcome {
        if err.is_terminal_rejection() {
            return HandlerOutcome::Skipped {
                reason: format!("task reached a terminal state before {operation}"),
            };
        }
        error!(task_id = %task_id, operation, error = %err, "Failed to persist task status");
        otherwise()
    }
}

impl std::fmt::Debug for StageJobHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageJobHandler")
            .field("kind", &self.kind)
            .field("executor", &self.executor.name())
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

fn outcome_label(outcome: &HandlerOutcome) -> &'static str {
    match outcome {
        HandlerOutcome::Completed { .. } => TaskState::Completed.as_str(),
        HandlerOutcome::Retry { .. } => "retry",
        HandlerOutcome::Failed { .. } => TaskState::Failed.as_str(),
        HandlerOutcome::Cancelled => TaskState::Cancelled.as_str(),
        HandlerOutcome::Skipped { .. } => "skipped",
    }
}
