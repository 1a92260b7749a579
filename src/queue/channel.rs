//! # Queue Channel
//!
//! One channel per [`TaskKind`]. `enqueue` hands the job to the broker when the broker
//! handle reports healthy, and otherwise runs the bound handler inline in the caller's
//! task, with a single attempt. Callers see the same contract either way.

use crate::config::QueueConfig;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::messaging::{BrokerHandle, JobMessage};
use crate::models::TaskKind;
use crate::queue::handler::{DeliveryContext, HandlerOutcome, StageJobHandler};
use crate::queue::retry::RetryPolicy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-job overrides of the channel defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnqueueOptions {
    pub priority: Option<u8>,
    pub max_attempts: Option<u32>,
    pub backoff_base: Option<Duration>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = Some(backoff_base);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchMode {
    /// Accepted by the broker; a worker will run it
    Broker { message_id: i64 },
    /// Ran to completion in the caller's task
    Inline { outcome: HandlerOutcome },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueReceipt {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub mode: DispatchMode,
}

impl EnqueueReceipt {
    pub fn is_inline(&self) -> bool {
        matches!(self.mode, DispatchMode::Inline { .. })
    }
}

pub struct QueueChannel {
    kind: TaskKind,
    queue_name: String,
    priority: u8,
    retry_policy: RetryPolicy,
    broker: Arc<BrokerHandle>,
    handler: RwLock<Option<Arc<StageJobHandler>>>,
}

impl QueueChannel {
    pub fn new(
        kind: TaskKind,
        queue_name: impl Into<String>,
        retry_policy: RetryPolicy,
        broker: Arc<BrokerHandle>,
    ) -> Self {
        Self {
            kind,
            queue_name: queue_name.into(),
            priority: 0,
            retry_policy,
            broker,
            handler: RwLock::new(None),
        }
    }

    pub fn from_config(kind: TaskKind, config: &QueueConfig, broker: Arc<BrokerHandle>) -> Self {
        Self::new(kind, config.name.clone(), config.retry_policy(), broker)
            .with_priority(config.priority)
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn broker(&self) -> &Arc<BrokerHandle> {
        &self.broker
    }

    /// Attach the handler that runs this channel's jobs, replacing any previous one
    pub fn bind(&self, handler: Arc<StageJobHandler>) {
        debug!(kind = %self.kind, queue = %self.queue_name, "Handler bound to channel");
        *self.handler.write() = Some(handler);
    }

    pub fn handler(&self) -> Option<Arc<StageJobHandler>> {
        self.handler.read().clone()
    }

    /// The channel policy with the job's own overrides applied
    pub fn policy_for(&self, job: &JobMessage) -> RetryPolicy {
        let mut policy = self
            .retry_policy
            .clone()
            .with_max_attempts(job.metadata.max_attempts);
        if let Some(base_ms) = job.metadata.backoff_base_ms {
            policy.base_delay = Duration::from_millis(base_ms);
        }
        policy
    }

    pub async fn enqueue(
        &self,
        mut job: JobMessage,
        options: EnqueueOptions,
    ) -> OrchestrationResult<EnqueueReceipt> {
        let handler = self.handler().ok_or_else(|| {
            OrchestrationError::dispatch_failure(job.task_id, self.kind, "no handler bound to channel")
        })?;

        job.metadata.priority = options.priority.unwrap_or(self.priority);
        job.metadata.max_attempts = options
            .max_attempts
            .unwrap_or(self.retry_policy.max_attempts)
            .max(1);
        job.metadata.backoff_base_ms = options.backoff_base.map(|d| d.as_millis() as u64);
        job.metadata.options = options;

        let receipt = |mode| EnqueueReceipt {
            job_id: job.job_id,
            task_id: job.task_id,
            mode,
        };

        match self.broker.broker() {
            Some(broker) if self.broker.healthy() => {
                let payload = job.to_json().map_err(|e| {
                    OrchestrationError::dispatch_failure(job.task_id, self.kind, e.to_string())
                })?;
                let message_id = broker
                    .send(&self.queue_name, payload, job.metadata.priority)
                    .await
                    .map_err(|e| {
                        warn!(task_id = %job.task_id, queue = %self.queue_name, error = %e, "Broker send failed");
                        OrchestrationError::dispatch_failure(job.task_id, self.kind, e.to_string())
                    })?;
                info!(
                    task_id = %job.task_id,
                    queue = %self.queue_name,
                    message_id,
                    priority = job.metadata.priority,
                    "📤 Job enqueued"
                );
                Ok(receipt(DispatchMode::Broker { message_id }))
            }
            _ => {
                debug!(task_id = %job.task_id, kind = %self.kind, "Broker unavailable, running inline");
                let outcome = handler.handle(&job, DeliveryContext::inline()).await;
                Ok(receipt(DispatchMode::Inline { outcome }))
            }
        }
    }
}

impl std::fmt::Debug for QueueChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueChannel")
            .field("kind", &self.kind)
            .field("queue_name", &self.queue_name)
            .field("priority", &self.priority)
            .field("bound", &self.handler.read().is_some())
            .finish()
    }
}
