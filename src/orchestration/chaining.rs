//! Auto-advance between stages.
//!
//! When a completed acquire or transform task asked for `auto_advance`, a new task for the
//! next stage is created with `origin_task_id` pointing back, `root_task_id` naming the
//! admitted task at the head of the chain, the prior output as its source spec, and the
//! same target and processing specs. Its job carries the enqueue options of the job that
//! completed. Chained tasks are not admissions and never pass through the quota gate.

use crate::constants::operations;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::logging::{log_error, log_task_operation};
use crate::messaging::JobMessage;
use crate::models::{NewTask, Task};
use crate::orchestration::orchestrator::dispatch_task;
use crate::queue::{ChannelRegistry, CompletionListener};
use crate::status_sink::StatusSink;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{info, warn};

pub struct StageChainer {
    sink: Arc<dyn StatusSink>,
    channels: Weak<ChannelRegistry>,
}

impl StageChainer {
    /// `channels` is weak because the registry owns the handlers that own this chainer
    pub fn new(sink: Arc<dyn StatusSink>, channels: Weak<ChannelRegistry>) -> Self {
        Self { sink, channels }
    }

    /// The task that should follow `task`, if any
    pub fn next_task(task: &Task) -> Option<NewTask> {
        if !task.auto_advance() {
            return None;
        }
        let next = task.kind.next_stage()?;
        Some(
            NewTask::new(task.tenant_id.clone(), next)
                .with_source_spec(task.output.clone().unwrap_or(Value::Null))
                .with_target_spec(task.target_spec.clone())
                .with_processing_spec(task.processing_spec.clone())
                .chained_from(task),
        )
    }
}

#[async_trait]
impl CompletionListener for StageChainer {
    async fn on_completed(&self, task: &Task, job: &JobMessage) -> OrchestrationResult<()> {
        let Some(new_task) = Self::next_task(task) else {
            return Ok(());
        };
        let Some(channels) = self.channels.upgrade() else {
            warn!(task_id = %task.task_id, "Channel registry gone, not chaining");
            return Ok(());
        };

        let next = self.sink.create_task(new_task).await.map_err(|e| {
            log_error(
                "stage_chainer",
                operations::CHAIN_TASK,
                &e.to_string(),
                Some(&format!("origin task {}", task.task_id)),
            );
            OrchestrationError::from(e)
        })?;
        info!(
            origin_task_id = %task.task_id,
            root_task_id = %next.correlation_id(),
            task_id = %next.task_id,
            kind = %next.kind,
            "⛓️ Chained next stage"
        );
        log_task_operation(operations::CHAIN_TASK, Some(next.task_id), Some(next.kind), "pending", None);

        // on failure the chained task stays pending for redispatch_task
        dispatch_task(self.sink.as_ref(), &channels, &next, job.metadata.options.clone())
            .await
            .map(|_| ())
            .map_err(|e| {
                log_error(
                    "stage_chainer",
                    operations::CHAIN_TASK,
                    &e.to_string(),
                    Some(&format!("chained task {}", next.task_id)),
                );
                e
            })
    }
}

impl std::fmt::Debug for StageChainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageChainer")
            .field("registry_alive", &(self.channels.strong_count() > 0))
            .finish()
    }
}
