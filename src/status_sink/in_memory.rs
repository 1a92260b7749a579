//! # In-Memory Status Sink
//!
//! Process-local [`StatusSink`] for tests and single-process deployments. Quotas are
//! configured per tenant with [`InMemoryStatusSink::set_quota`]; the clock can be
//! replaced to exercise day boundaries.

use super::{start_of_day, StatusSink, StatusSinkError, StatusSinkResult};
use crate::models::{NewTask, Task, TaskStatusUpdate, TenantId};
use crate::state_machine::{TaskState, TaskStateMachine};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Source of the current time
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct InMemoryStatusSink {
    tasks: RwLock<HashMap<Uuid, Task>>,
    quotas: RwLock<HashMap<TenantId, u32>>,
    clock: Clock,
}

impl InMemoryStatusSink {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            quotas: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Configure the daily quota for a tenant
    pub fn set_quota(&self, tenant_id: impl Into<TenantId>, quota: u32) {
        self.quotas.write().insert(tenant_id.into(), quota);
    }

    /// All tasks for a tenant, oldest first
    pub fn tasks_for_tenant(&self, tenant_id: &TenantId) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|task| &task.tenant_id == tenant_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    fn admitted_today(tasks: &HashMap<Uuid, Task>, tenant_id: &TenantId, now: DateTime<Utc>) -> u64 {
        let day_start = start_of_day(now);
        tasks
            .values()
            .filter(|task| {
                &task.tenant_id == tenant_id
                    && task.origin_task_id.is_none()
                    && task.created_at >= day_start
                    && task.created_at.date_naive() == now.date_naive()
            })
            .count() as u64
    }
}

impl Default for InMemoryStatusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryStatusSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStatusSink")
            .field("tasks", &self.tasks.read().len())
            .field("quotas", &self.quotas.read().len())
            .finish()
    }
}

#[async_trait]
impl StatusSink for InMemoryStatusSink {
    async fn create_task(&self, new_task: NewTask) -> StatusSinkResult<Task> {
        let task = new_task.into_task((self.clock)());
        self.tasks.write().insert(task.task_id, task.clone());
        Ok(task)
    }

    async fn create_task_within_quota(
        &self,
        new_task: NewTask,
        quota: u32,
    ) -> StatusSinkResult<Option<Task>> {
        let now = (self.clock)();
        let mut tasks = self.tasks.write();
        if Self::admitted_today(&tasks, &new_task.tenant_id, now) >= u64::from(quota) {
            return Ok(None);
        }
        let task = new_task.into_task(now);
        tasks.insert(task.task_id, task.clone());
        Ok(Some(task))
    }

    async fn update_status(
        &self,
        task_id: Uuid,
        update: TaskStatusUpdate,
    ) -> StatusSinkResult<Task> {
        let now = (self.clock)();
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StatusSinkError::NotFound { task_id })?;

        // Apply to a copy so a rejected update leaves the record untouched
        let mut updated = task.clone();
        TaskStateMachine::apply(&mut updated, &update, now)
            .map_err(|source| StatusSinkError::TransitionRejected { task_id, source })?;
        *task = updated.clone();
        Ok(updated)
    }

    async fn get_task(&self, task_id: Uuid) -> StatusSinkResult<Task> {
        self.tasks
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(StatusSinkError::NotFound { task_id })
    }

    async fn claim_dispatch(&self, task_id: Uuid, job_id: Uuid) -> StatusSinkResult<bool> {
        let now = (self.clock)();
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StatusSinkError::NotFound { task_id })?;
        if task.status != TaskState::Pending || task.is_dispatched() {
            return Ok(false);
        }
        task.dispatched_job_id = Some(job_id);
        task.dispatched_at = Some(now);
        Ok(true)
    }

    async fn release_dispatch(&self, task_id: Uuid, job_id: Uuid) -> StatusSinkResult<()> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StatusSinkError::NotFound { task_id })?;
        if task.dispatched_job_id == Some(job_id) {
            task.dispatched_job_id = None;
            task.dispatched_at = None;
        }
        Ok(())
    }

    async fn count_tasks_today(&self, tenant_id: &TenantId) -> StatusSinkResult<u64> {
        let now = (self.clock)();
        Ok(Self::admitted_today(&self.tasks.read(), tenant_id, now))
    }

    async fn get_quota(&self, tenant_id: &TenantId) -> StatusSinkResult<Option<u32>> {
        Ok(self.quotas.read().get(tenant_id).copied())
    }

    async fn delete_task(&self, task_id: Uuid) -> StatusSinkResult<()> {
        self.tasks
            .write()
            .remove(&task_id)
            .map(|_| ())
            .ok_or(StatusSinkError::NotFound { task_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskKind;
    use crate::state_machine::TaskEvent;
    use chrono::{Duration, TimeZone};
    use parking_lot::Mutex;

    fn new_task(tenant: &str) -> NewTask {
        NewTask::new(tenant, TaskKind::Acquire)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let sink = InMemoryStatusSink::new();
        let task = sink.create_task(new_task("tenant-a")).await.unwrap();

        let fetched = sink.get_task(task.task_id).await.unwrap();
        assert_eq!(fetched, task);
        assert_eq!(fetched.status, TaskState::Pending);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_update_leaves_record_untouched() {
        let sink = InMemoryStatusSink::new();
        let task = sink.create_task(new_task("tenant-a")).await.unwrap();

        let err = sink
            .update_status(task.task_id, TaskEvent::Complete(None).into())
            .await
            .unwrap_err();
        assert!(matches!(err, StatusSinkError::TransitionRejected { .. }));
        assert_eq!(sink.get_task(task.task_id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn test_count_excludes_chained_and_other_tenants() {
        let sink = InMemoryStatusSink::new();
        let root = sink.create_task(new_task("tenant-a")).await.unwrap();
        sink.create_task(new_task("tenant-a").chained_from(&root))
            .await
            .unwrap();
        sink.create_task(new_task("tenant-b")).await.unwrap();

        let count = sink.count_tasks_today(&TenantId::new("tenant-a")).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_quota_window_resets_at_day_boundary() {
        let now = Arc::new(Mutex::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 23, 30, 0).unwrap(),
        ));
        let clock_now = now.clone();
        let sink = InMemoryStatusSink::with_clock(Arc::new(move || *clock_now.lock()));
        let tenant = TenantId::new("tenant-a");

        assert!(sink
            .create_task_within_quota(new_task("tenant-a"), 1)
            .await
            .unwrap()
            .is_some());
        assert!(sink
            .create_task_within_quota(new_task("tenant-a"), 1)
            .await
            .unwrap()
            .is_none());
        assert_eq!(sink.count_tasks_today(&tenant).await.unwrap(), 1);

        *now.lock() += Duration::hours(1);
        assert_eq!(sink.count_tasks_today(&tenant).await.unwrap(), 0);
        assert!(sink
            .create_task_within_quota(new_task("tenant-a"), 1)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_quota_lookup() {
        let sink = InMemoryStatusSink::new();
        sink.set_quota("tenant-a", 7);
        assert_eq!(sink.get_quota(&"tenant-a".into()).await.unwrap(), Some(7));
        assert_eq!(sink.get_quota(&"tenant-b".into()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dispatch_claim_is_exclusive() {
        let sink = InMemoryStatusSink::new();
        let task = sink.create_task(new_task("tenant-a")).await.unwrap();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(sink.claim_dispatch(task.task_id, first).await.unwrap());
        assert!(!sink.claim_dispatch(task.task_id, second).await.unwrap());

        // releasing someone else's claim is a no-op
        sink.release_dispatch(task.task_id, second).await.unwrap();
        let claimed = sink.get_task(task.task_id).await.unwrap();
        assert_eq!(claimed.dispatched_job_id, Some(first));
        assert!(claimed.dispatched_at.is_some());

        sink.release_dispatch(task.task_id, first).await.unwrap();
        assert!(!sink.get_task(task.task_id).await.unwrap().is_dispatched());
        assert!(sink.claim_dispatch(task.task_id, second).await.unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_claim_requires_pending() {
        let sink = InMemoryStatusSink::new();
        let task = sink.create_task(new_task("tenant-a")).await.unwrap();
        sink.update_status(task.task_id, TaskEvent::Cancel.into())
            .await
            .unwrap();

        assert!(!sink.claim_dispatch(task.task_id, Uuid::new_v4()).await.unwrap());
        assert!(matches!(
            sink.claim_dispatch(Uuid::new_v4(), Uuid::new_v4()).await,
            Err(StatusSinkError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_task() {
        let sink = InMemoryStatusSink::new();
        let err = sink.delete_task(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StatusSinkError::NotFound { .. }));
    }
}
