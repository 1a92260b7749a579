//! # PostgreSQL Status Sink
//!
//! Stores tasks in `conveyor_tasks` and quotas in `conveyor_tenant_quotas`
//! (schema in `migrations/`). Updates load the row `FOR UPDATE`, run it through the
//! state machine and write it back inside one transaction. Quota-checked inserts
//! serialize per tenant with a transaction-scoped advisory lock.

use super::{start_of_day, StatusSink, StatusSinkError, StatusSinkResult};
use crate::models::{NewTask, Task, TaskKind, TaskStatusUpdate, TenantId};
use crate::state_machine::{TaskState, TaskStateMachine};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

const TASK_COLUMNS: &str = "task_id, tenant_id, kind, status, progress, source_spec, \
     target_spec, processing_spec, error_detail, output, origin_task_id, root_task_id, \
     dispatched_job_id, dispatched_at, attempts, created_at, started_at, completed_at, \
     updated_at";

/// Per-tenant lock for quota-checked inserts, keyed by a server-side hash
const QUOTA_LOCK_SQL: &str = "SELECT pg_advisory_xact_lock(hashtext($1))";

/// Raw row; enum columns are stored as text
#[derive(Debug, Clone, FromRow)]
struct TaskRow {
    task_id: Uuid,
    tenant_id: String,
    kind: String,
    status: String,
    progress: f64,
    source_spec: Value,
    target_spec: Value,
    processing_spec: Value,
    error_detail: Option<String>,
    output: Option<Value>,
    origin_task_id: Option<Uuid>,
    root_task_id: Option<Uuid>,
    dispatched_job_id: Option<Uuid>,
    dispatched_at: Option<DateTime<Utc>>,
    attempts: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StatusSinkError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let kind: TaskKind = row.kind.parse().map_err(StatusSinkError::Database)?;
        let status: TaskState = row.status.parse().map_err(StatusSinkError::Database)?;
        Ok(Task {
            task_id: row.task_id,
            tenant_id: TenantId::new(row.tenant_id),
            kind,
            status,
            progress: row.progress,
            source_spec: row.source_spec,
            target_spec: row.target_spec,
            processing_spec: row.processing_spec,
            error_detail: row.error_detail,
            output: row.output,
            origin_task_id: row.origin_task_id,
            root_task_id: row.root_task_id,
            dispatched_job_id: row.dispatched_job_id,
            dispatched_at: row.dispatched_at,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

/// PostgreSQL-backed [`StatusSink`]
#[derive(Debug, Clone)]
pub struct PgStatusSink {
    pool: PgPool,
}

impl PgStatusSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply pending migrations
    pub async fn connect(database_url: &str) -> StatusSinkResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        let sink = Self::new(pool);
        sink.migrate().await?;
        Ok(sink)
    }

    pub async fn migrate(&self) -> StatusSinkResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StatusSinkError::Database(format!("Migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Upsert a tenant's daily quota
    pub async fn set_quota(&self, tenant_id: &TenantId, quota: u32) -> StatusSinkResult<()> {
        sqlx::query(
            "INSERT INTO conveyor_tenant_quotas (tenant_id, daily_quota, updated_at) \
             VALUES ($1, $2, NOW()) \
             ON CONFLICT (tenant_id) DO UPDATE SET daily_quota = EXCLUDED.daily_quota, \
             updated_at = NOW()",
        )
        .bind(tenant_id.as_str())
        .bind(i32::try_from(quota).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        task: &Task,
    ) -> StatusSinkResult<()> {
        sqlx::query(&format!(
            "INSERT INTO conveyor_tasks ({TASK_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19)"
        ))
        .bind(task.task_id)
        .bind(task.tenant_id.as_str())
        .bind(task.kind.as_str())
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(&task.source_spec)
        .bind(&task.target_spec)
        .bind(&task.processing_spec)
        .bind(&task.error_detail)
        .bind(&task.output)
        .bind(task.origin_task_id)
        .bind(task.root_task_id)
        .bind(task.dispatched_job_id)
        .bind(task.dispatched_at)
        .bind(task.attempts as i32)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn count_admitted(
        executor: &mut sqlx::PgConnection,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> StatusSinkResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conveyor_tasks \
             WHERE tenant_id = $1 AND origin_task_id IS NULL AND created_at >= $2",
        )
        .bind(tenant_id.as_str())
        .bind(start_of_day(now))
        .fetch_one(executor)
        .await?;
        Ok(count.max(0) as u64)
    }

    fn quota_lock_key(tenant_id: &TenantId) -> String {
        format!("conveyor_quota:{tenant_id}")
    }
}

#[async_trait]
impl StatusSink for PgStatusSink {
    #[instrument(skip(self, new_task), fields(tenant_id = %new_task.tenant_id))]
    async fn create_task(&self, new_task: NewTask) -> StatusSinkResult<Task> {
        let task = new_task.into_task(Utc::now());
        let mut tx = self.pool.begin().await?;
        Self::insert(&mut tx, &task).await?;
        tx.commit().await?;
        debug!(task_id = %task.task_id, "Task persisted");
        Ok(task)
    }

    #[instrument(skip(self, new_task), fields(tenant_id = %new_task.tenant_id))]
    async fn create_task_within_quota(
        &self,
        new_task: NewTask,
        quota: u32,
    ) -> StatusSinkResult<Option<Task>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(QUOTA_LOCK_SQL)
            .bind(Self::quota_lock_key(&new_task.tenant_id))
            .execute(&mut *tx)
            .await?;

        let count = Self::count_admitted(&mut tx, &new_task.tenant_id, now).await?;
        if count >= u64::from(quota) {
            tx.rollback().await?;
            return Ok(None);
        }

        let task = new_task.into_task(now);
        Self::insert(&mut tx, &task).await?;
        tx.commit().await?;
        Ok(Some(task))
    }

    #[instrument(skip(self, update), fields(status = %update.status))]
    async fn update_status(
        &self,
        task_id: Uuid,
        update: TaskStatusUpdate,
    ) -> StatusSinkResult<Task> {
        let mut tx = self.pool.begin().await?;

        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM conveyor_tasks WHERE task_id = $1 FOR UPDATE"
        ))
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?;
        let mut task = Task::try_from(row.ok_or(StatusSinkError::NotFound { task_id })?)?;

        TaskStateMachine::apply(&mut task, &update, Utc::now())
            .map_err(|source| StatusSinkError::TransitionRejected { task_id, source })?;

        sqlx::query(
            "UPDATE conveyor_tasks SET status = $2, progress = $3, error_detail = $4, \
             output = $5, attempts = $6, started_at = $7, completed_at = $8, updated_at = $9 \
             WHERE task_id = $1",
        )
        .bind(task.task_id)
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(&task.error_detail)
        .bind(&task.output)
        .bind(task.attempts as i32)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(task)
    }

    async fn get_task(&self, task_id: Uuid) -> StatusSinkResult<Task> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM conveyor_tasks WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Task::try_from(row.ok_or(StatusSinkError::NotFound { task_id })?)
    }

    async fn claim_dispatch(&self, task_id: Uuid, job_id: Uuid) -> StatusSinkResult<bool> {
        let result = sqlx::query(
            "UPDATE conveyor_tasks SET dispatched_job_id = $2, dispatched_at = NOW() \
             WHERE task_id = $1 AND status = 'pending' AND dispatched_job_id IS NULL",
        )
        .bind(task_id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // distinguish a missing task from one that is not claimable
        self.get_task(task_id).await.map(|_| false)
    }

    async fn release_dispatch(&self, task_id: Uuid, job_id: Uuid) -> StatusSinkResult<()> {
        sqlx::query(
            "UPDATE conveyor_tasks SET dispatched_job_id = NULL, dispatched_at = NULL \
             WHERE task_id = $1 AND dispatched_job_id = $2",
        )
        .bind(task_id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_tasks_today(&self, tenant_id: &TenantId) -> StatusSinkResult<u64> {
        let mut conn = self.pool.acquire().await?;
        Self::count_admitted(&mut conn, tenant_id, Utc::now()).await
    }

    async fn get_quota(&self, tenant_id: &TenantId) -> StatusSinkResult<Option<u32>> {
        let quota: Option<i32> = sqlx::query_scalar(
            "SELECT daily_quota FROM conveyor_tenant_quotas WHERE tenant_id = $1",
        )
        .bind(tenant_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(quota.map(|q| u32::try_from(q).unwrap_or(0)))
    }

    async fn delete_task(&self, task_id: Uuid) -> StatusSinkResult<()> {
        let result = sqlx::query("DELETE FROM conveyor_tasks WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StatusSinkError::NotFound { task_id });
        }
        Ok(())
    }
}
