//! # Job Messages
//!
//! The ephemeral unit placed on a stage queue. Jobs are never persisted by the core;
//! they travel through the broker as JSON.

use super::errors::{MessagingError, MessagingResult};
use crate::models::{Task, TaskKind, TenantId};
use crate::queue::EnqueueOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Stage inputs copied from the task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePayload {
    pub source_spec: Value,
    pub target_spec: Value,
    pub processing_spec: Value,
}

impl StagePayload {
    pub fn from_task(task: &Task) -> Self {
        Self {
            source_spec: task.source_spec.clone(),
            target_spec: task.target_spec.clone(),
            processing_spec: task.processing_spec.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub created_at: DateTime<Utc>,
    pub priority: u8,
    pub max_attempts: u32,
    /// Overrides the channel's backoff base delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_base_ms: Option<u64>,
    /// Shared by every job descended from the same admitted task
    pub correlation_id: Uuid,
    /// Overrides the caller asked for; chained stages inherit them
    #[serde(default)]
    pub options: EnqueueOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub tenant_id: TenantId,
    pub kind: TaskKind,
    pub payload: StagePayload,
    pub metadata: JobMetadata,
}

impl JobMessage {
    /// Build the job for a freshly persisted task
    pub fn for_task(task: &Task) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            task_id: task.task_id,
            tenant_id: task.tenant_id.clone(),
            kind: task.kind,
            payload: StagePayload::from_task(task),
            metadata: JobMetadata {
                created_at: Utc::now(),
                priority: 0,
                max_attempts: 1,
                backoff_base_ms: None,
                correlation_id: task.correlation_id(),
                options: EnqueueOptions::default(),
            },
        }
    }

    pub fn to_json(&self) -> MessagingResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: Value) -> MessagingResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| MessagingError::message_deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTask;
    use serde_json::json;

    #[test]
    fn test_job_carries_task_payload() {
        let task = NewTask::new("tenant-a", TaskKind::Deliver)
            .with_target_spec(json!({"bucket": "out"}))
            .into_task(Utc::now());
        let job = JobMessage::for_task(&task);

        assert_eq!(job.task_id, task.task_id);
        assert_eq!(job.kind, TaskKind::Deliver);
        assert_eq!(job.payload.target_spec["bucket"], "out");
        assert_eq!(job.metadata.correlation_id, task.task_id);
    }

    #[test]
    fn test_json_shape() {
        let task = NewTask::new("tenant-a", TaskKind::Acquire).into_task(Utc::now());
        let job = JobMessage::for_task(&task);
        let value = job.to_json().unwrap();

        assert_eq!(value["kind"], "acquire");
        assert_eq!(value["tenant_id"], "tenant-a");
        assert_eq!(JobMessage::from_json(value).unwrap(), job);
    }

    #[test]
    fn test_chained_job_correlates_to_chain_root() {
        let acquire = NewTask::new("tenant-a", TaskKind::Acquire).into_task(Utc::now());
        let transform = NewTask::new("tenant-a", TaskKind::Transform)
            .chained_from(&acquire)
            .into_task(Utc::now());
        let deliver = NewTask::new("tenant-a", TaskKind::Deliver)
            .chained_from(&transform)
            .into_task(Utc::now());

        assert_eq!(JobMessage::for_task(&deliver).metadata.correlation_id, acquire.task_id);
    }

    #[test]
    fn test_undecodable_payload() {
        let err = JobMessage::from_json(json!({"garbage": true})).unwrap_err();
        assert!(matches!(err, MessagingError::MessageDeserialization { .. }));
    }
}
