//! # Pipeline Orchestrator
//!
//! Public entry point for task lifecycle operations. `create_task` runs admission,
//! persists the task as `pending` and hands its job to the channel for the task's
//! kind. The caller gets the same result shape whether the channel queued the job
//! or ran it inline; only how far the returned task has progressed differs.
//!
//! A task has at most one outstanding job. Dispatch records the job id on the task
//! before the job leaves the process, and redispatch is refused once one is recorded.

use crate::config::AdmissionConfig;
use crate::constants::operations;
use crate::error::{DenialReason, OrchestrationError, OrchestrationResult};
use crate::logging::{log_error, log_task_operation};
use crate::messaging::JobMessage;
use crate::models::{NewTask, Task, TaskKind, TenantId};
use crate::orchestration::admission::AdmissionController;
use crate::queue::{CancellationRegistry, ChannelRegistry, EnqueueOptions, EnqueueReceipt};
use crate::state_machine::{TaskEvent, TaskState};
use crate::status_sink::{StatusSink, StatusSinkError};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// A request to admit and dispatch a new task
#[derive(Debug, Clone, PartialEq)]
pub struct CreateTaskRequest {
    pub tenant_id: TenantId,
    pub kind: TaskKind,
    pub source_spec: Value,
    pub target_spec: Value,
    pub processing_spec: Value,
    pub options: EnqueueOptions,
}

impl CreateTaskRequest {
    pub fn new(tenant_id: impl Into<TenantId>, kind: TaskKind) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            kind,
            source_spec: Value::Null,
            target_spec: Value::Null,
            processing_spec: Value::Null,
            options: EnqueueOptions::default(),
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

    pub fn with_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }

    fn into_new_task(self) -> (NewTask, EnqueueOptions) {
        let task = NewTask::new(self.tenant_id, self.kind)
            .with_source_spec(self.source_spec)
            .with_target_spec(self.target_spec)
            .with_processing_spec(self.processing_spec);
        (task, self.options)
    }
}

pub struct PipelineOrchestrator {
    sink: Arc<dyn StatusSink>,
    admission: AdmissionController,
    channels: Arc<ChannelRegistry>,
    cancellations: CancellationRegistry,
    atomic_admission: bool,
}

impl PipelineOrchestrator {
    pub fn new(
        sink: Arc<dyn StatusSink>,
        channels: Arc<ChannelRegistry>,
        cancellations: CancellationRegistry,
        admission: &AdmissionConfig,
    ) -> Self {
        Self {
            admission: AdmissionController::new(sink.clone(), admission.default_daily_quota),
            sink,
            channels,
            cancellations,
            atomic_admission: admission.atomic,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    /// Admit, persist and dispatch a new task
    ///
    /// On `DispatchFailure` the task exists and stays `pending`; pass the `task_id` from
    /// the error to [`redispatch_task`](Self::redispatch_task) to try again.
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, kind = %request.kind))]
    pub async fn create_task(&self, request: CreateTaskRequest) -> OrchestrationResult<Task> {
        let tenant_id = request.tenant_id.clone();
        let (new_task, options) = request.into_new_task();

        let task = if self.atomic_admission {
            self.admit_and_create(new_task).await?
        } else {
            self.admission
                .admit(&tenant_id, new_task.kind)
                .await
                .into_result()
                .map_err(|reason| denied(tenant_id.clone(), reason))?;
            self.sink.create_task(new_task).await?
        };

        log_task_operation(operations::CREATE_TASK, Some(task.task_id), Some(task.kind), "pending", None);
        self.dispatch(&task, options).await?;
        Ok(self.latest(task).await)
    }

    pub async fn get_task(&self, task_id: Uuid) -> OrchestrationResult<Task> {
        Ok(self.sink.get_task(task_id).await?)
    }

    /// Mark a pending or running task cancelled and signal its executor, if one is running
    #[instrument(skip(self))]
    pub async fn cancel_task(&self, task_id: Uuid) -> OrchestrationResult<Task> {
        let task = self.sink.get_task(task_id).await?;
        if task.is_terminal() {
            return Err(OrchestrationError::status_conflict(task_id, task.status, "cancel"));
        }

        let cancelled = match self.sink.update_status(task_id, TaskEvent::Cancel.into()).await {
            Ok(task) => task,
            Err(StatusSinkError::TransitionRejected { .. }) => {
                // finished between the read and the update
                let current = self.sink.get_task(task_id).await?;
                return Err(OrchestrationError::status_conflict(task_id, current.status, "cancel"));
            }
            Err(e) => return Err(e.into()),
        };

        let signalled = self.cancellations.cancel(task_id);
        info!(task_id = %task_id, signalled, "🛑 Task cancelled");
        log_task_operation(operations::CANCEL_TASK, Some(task_id), Some(task.kind), "cancelled", None);
        Ok(cancelled)
    }

    /// Remove a terminal task
    #[instrument(skip(self))]
    pub async fn delete_task(&self, task_id: Uuid) -> OrchestrationResult<()> {
        let task = self.sink.get_task(task_id).await?;
        if !task.is_terminal() {
            return Err(OrchestrationError::status_conflict(task_id, task.status, "delete"));
        }
        self.sink.delete_task(task_id).await?;
        log_task_operation(operations::DELETE_TASK, Some(task_id), Some(task.kind), task.status.as_str(), None);
        Ok(())
    }

    /// Hand a still-`pending` task's job to its channel again, typically after a
    /// `DispatchFailure`
    #[instrument(skip(self, options))]
    pub async fn redispatch_task(
        &self,
        task_id: Uuid,
        options: EnqueueOptions,
    ) -> OrchestrationResult<Task> {
        let task = self.sink.get_task(task_id).await?;
        if task.status != TaskState::Pending {
            return Err(OrchestrationError::status_conflict(task_id, task.status, "redispatch"));
        }
        if task.is_dispatched() {
            return Err(OrchestrationError::status_conflict(
                task_id,
                task.status,
                "redispatch a task whose job is already queued",
            ));
        }
        self.dispatch(&task, options).await?;
        log_task_operation(operations::REDISPATCH_TASK, Some(task_id), Some(task.kind), "dispatched", None);
        Ok(self.latest(task).await)
    }

    async fn admit_and_create(&self, new_task: NewTask) -> OrchestrationResult<Task> {
        let tenant_id = new_task.tenant_id.clone();
        let quota = match self.admission.effective_quota(&tenant_id).await {
            Ok(Some(quota)) => quota,
            Ok(None) => {
                return Err(denied(
                    tenant_id.clone(),
                    DenialReason::QuotaUnavailable {
                        message: format!("no daily quota configured for tenant {tenant_id}"),
                    },
                ))
            }
            Err(reason) => return Err(denied(tenant_id, reason)),
        };

        match self.sink.create_task_within_quota(new_task, quota).await? {
            Some(task) => Ok(task),
            None => {
                let count = self
                    .sink
                    .count_tasks_today(&tenant_id)
                    .await
                    .unwrap_or(u64::from(quota));
                Err(denied(tenant_id, DenialReason::QuotaExceeded { count, quota }))
            }
        }
    }

    async fn dispatch(&self, task: &Task, options: EnqueueOptions) -> OrchestrationResult<EnqueueReceipt> {
        dispatch_task(self.sink.as_ref(), &self.channels, task, options).await
    }

    /// Re-read the task, falling back to `task` if the sink cannot be reached
    async fn latest(&self, task: Task) -> Task {
        match self.sink.get_task(task.task_id).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Could not re-read task after dispatch");
                task
            }
        }
    }
}

/// Claim `task` for a fresh job and hand that job to the task kind's channel
///
/// Fails with `StatusConflict` when the task is no longer `pending` or already has a
/// job. If the channel rejects the job the claim is released, so the task can be
/// redispatched.
pub(crate) async fn dispatch_task(
    sink: &dyn StatusSink,
    channels: &ChannelRegistry,
    task: &Task,
    options: EnqueueOptions,
) -> OrchestrationResult<EnqueueReceipt> {
    let channel = channels
        .channel(task.kind)
        .map_err(|e| OrchestrationError::dispatch_failure(task.task_id, task.kind, e.to_string()))?;

    let job = JobMessage::for_task(task);
    let job_id = job.job_id;
    if !sink.claim_dispatch(task.task_id, job_id).await? {
        let current = sink.get_task(task.task_id).await?;
        return Err(OrchestrationError::status_conflict(
            task.task_id,
            current.status,
            "dispatch a task whose job is already queued",
        ));
    }

    let result = channel.enqueue(job, options).await;
    if let Err(e) = &result {
        error!(task_id = %task.task_id, kind = %task.kind, error = %e, "❌ Dispatch failed, task left pending");
        if let Err(release) = sink.release_dispatch(task.task_id, job_id).await {
            log_error(
                "pipeline_orchestrator",
                "release_dispatch",
                &release.to_string(),
                Some(&format!("task {} job {job_id}", task.task_id)),
            );
        }
    }
    result
}

fn denied(tenant_id: TenantId, reason: DenialReason) -> OrchestrationError {
    info!(tenant_id = %tenant_id, reason = %reason, "🚫 Admission denied");
    OrchestrationError::AdmissionDenied { tenant_id, reason }
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("atomic_admission", &self.atomic_admission)
            .field("admission", &self.admission)
            .finish()
    }
}
