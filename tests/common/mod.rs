//! Shared helpers for the integration tests: scripted stage executors, a status sink
//! that can be made to fail, fast pipeline configuration and polling helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use conveyor_core::config::PipelineConfig;
use conveyor_core::messaging::BrokerHandle;
use conveyor_core::models::{NewTask, Task, TaskKind, TaskStatusUpdate, TenantId};
use conveyor_core::orchestration::PipelineOrchestrator;
use conveyor_core::queue::{CancellationRegistry, ChannelRegistry, StageJobHandler};
use conveyor_core::stages::{
    StageContext, StageError, StageExecutor, StageExecutors, StageOutput, StagePayload,
};
use conveyor_core::status_sink::{InMemoryStatusSink, StatusSink, StatusSinkError, StatusSinkResult};
use conveyor_core::TaskState;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

pub const TENANT: &str = "tenant-a";

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("conveyor_core=debug")
        .with_test_writer()
        .try_init();
}

/// Configuration with millisecond polling and backoff so broker-mode tests finish quickly
pub fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig {
        environment: "test".to_string(),
        ..PipelineConfig::default()
    };
    for kind in TaskKind::ALL {
        let queue = config.queues.for_kind_mut(kind);
        queue.poll_interval_ms = 5;
        queue.backoff_base_ms = 1;
        queue.backoff_max_ms = 5;
        queue.jitter_factor = 0.0;
        queue.visibility_timeout_seconds = 30;
    }
    config.broker.shutdown_timeout_seconds = 5;
    config
}

/// Executor that fails the first `fail_times` invocations for each task.
///
/// Behaviour is read from the task's source spec:
/// `{"fail_times": n, "permanent": bool, "progress": [f64...], "output": value}`.
#[derive(Default)]
pub struct ScriptedExecutor {
    invocations: Mutex<HashMap<Uuid, u32>>,
    payloads: Mutex<Vec<StagePayload>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn invocations(&self, task_id: Uuid) -> u32 {
        self.invocations.lock().get(&task_id).copied().unwrap_or(0)
    }

    pub fn total_invocations(&self) -> u32 {
        self.invocations.lock().values().sum()
    }

    pub fn payloads(&self) -> Vec<StagePayload> {
        self.payloads.lock().clone()
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn run(&self, payload: StagePayload, ctx: StageContext) -> Result<StageOutput, StageError> {
        let invocation = {
            let mut invocations = self.invocations.lock();
            let count = invocations.entry(ctx.task_id).or_insert(0);
            *count += 1;
            *count
        };
        self.payloads.lock().push(payload.clone());

        let script = &payload.source_spec;
        if let Some(steps) = script.get("progress").and_then(Value::as_array) {
            for fraction in steps.iter().filter_map(Value::as_f64) {
                ctx.report_progress(fraction, None);
                tokio::task::yield_now().await;
            }
        }

        let fail_times = script.get("fail_times").and_then(Value::as_u64).unwrap_or(0);
        if u64::from(invocation) <= fail_times {
            let message = format!("scripted failure {invocation}");
            return Err(if script.get("permanent").and_then(Value::as_bool) == Some(true) {
                StageError::permanent(message)
            } else {
                StageError::retryable(message)
            });
        }

        let output = script
            .get("output")
            .cloned()
            .unwrap_or_else(|| json!({"stage": ctx.kind.as_str(), "attempt": invocation}));
        Ok(StageOutput::new(output))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Executor that parks until its task is cancelled
#[derive(Default)]
pub struct BlockingExecutor {
    pub started: Notify,
    pub observed_cancel: AtomicBool,
    pub runs: AtomicU32,
}

impl BlockingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl StageExecutor for BlockingExecutor {
    async fn run(&self, _payload: StagePayload, ctx: StageContext) -> Result<StageOutput, StageError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        ctx.report_progress(0.25, Some("waiting"));
        self.started.notify_one();
        ctx.cancelled().await;
        self.observed_cancel.store(true, Ordering::SeqCst);
        Err(StageError::Cancelled)
    }

    fn name(&self) -> &str {
        "blocking"
    }
}

/// In-memory sink that records every accepted update and can fail quota reads
#[derive(Default)]
pub struct InstrumentedSink {
    pub inner: InMemoryStatusSink,
    pub fail_quota_reads: AtomicBool,
    pub fail_counts: AtomicBool,
    history: Mutex<Vec<(Uuid, TaskState, f64)>>,
}

impl InstrumentedSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(status, progress)` after each accepted update for `task_id`, in order
    pub fn history(&self, task_id: Uuid) -> Vec<(TaskState, f64)> {
        self.history
            .lock()
            .iter()
            .filter(|(id, _, _)| *id == task_id)
            .map(|(_, status, progress)| (*status, *progress))
            .collect()
    }
}

#[async_trait]
impl StatusSink for InstrumentedSink {
    async fn create_task(&self, new_task: NewTask) -> StatusSinkResult<Task> {
        self.inner.create_task(new_task).await
    }

    async fn create_task_within_quota(
        &self,
        new_task: NewTask,
        quota: u32,
    ) -> StatusSinkResult<Option<Task>> {
        self.inner.create_task_within_quota(new_task, quota).await
    }

    async fn update_status(
        &self,
        task_id: Uuid,
        update: TaskStatusUpdate,
    ) -> StatusSinkResult<Task> {
        let task = self.inner.update_status(task_id, update).await?;
        self.history.lock().push((task_id, task.status, task.progress));
        Ok(task)
    }

    async fn get_task(&self, task_id: Uuid) -> StatusSinkResult<Task> {
        self.inner.get_task(task_id).await
    }

    async fn count_tasks_today(&self, tenant_id: &TenantId) -> StatusSinkResult<u64> {
        if self.fail_counts.load(Ordering::SeqCst) {
            return Err(StatusSinkError::Unavailable("count query timed out".to_string()));
        }
        self.inner.count_tasks_today(tenant_id).await
    }

    async fn get_quota(&self, tenant_id: &TenantId) -> StatusSinkResult<Option<u32>> {
        if self.fail_quota_reads.load(Ordering::SeqCst) {
            return Err(StatusSinkError::Unavailable("quota store offline".to_string()));
        }
        self.inner.get_quota(tenant_id).await
    }

    async fn delete_task(&self, task_id: Uuid) -> StatusSinkResult<()> {
        self.inner.delete_task(task_id).await
    }

    async fn claim_dispatch(&self, task_id: Uuid, job_id: Uuid) -> StatusSinkResult<bool> {
        self.inner.claim_dispatch(task_id, job_id).await
    }

    async fn release_dispatch(&self, task_id: Uuid, job_id: Uuid) -> StatusSinkResult<()> {
        self.inner.release_dispatch(task_id, job_id).await
    }
}

/// Executors for every single stage backed by the same scripted executor
pub fn scripted_executors(executor: &Arc<ScriptedExecutor>) -> StageExecutors {
    let mut executors = StageExecutors::new();
    for kind in [TaskKind::Acquire, TaskKind::Transform, TaskKind::Deliver] {
        executors.register(kind, executor.clone());
    }
    executors
}

/// Orchestrator wired by hand, with handlers bound but no workers started
pub struct ManualPipeline {
    pub orchestrator: PipelineOrchestrator,
    pub channels: Arc<ChannelRegistry>,
}

pub async fn manual_pipeline(
    config: &PipelineConfig,
    sink: Arc<dyn StatusSink>,
    broker: Arc<BrokerHandle>,
    executors: StageExecutors,
) -> ManualPipeline {
    let channels = Arc::new(ChannelRegistry::from_config(&config.queues, broker));
    channels.initialize_queues().await.expect("queues created");

    let cancellations = CancellationRegistry::new();
    let executors = executors.with_derived_composite();
    for kind in executors.kinds() {
        let executor = executors.get(kind).expect("registered");
        let handler = StageJobHandler::new(kind, executor, sink.clone(), cancellations.clone());
        channels.channel(kind).expect("channel").bind(Arc::new(handler));
    }

    let orchestrator =
        PipelineOrchestrator::new(sink, channels.clone(), cancellations, &config.admission);
    ManualPipeline {
        orchestrator,
        channels,
    }
}

/// Poll the sink until `done` holds for the task, panicking after `timeout`
pub async fn wait_for_task<F>(sink: &dyn StatusSink, task_id: Uuid, timeout: Duration, done: F) -> Task
where
    F: Fn(&Task) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(task) = sink.get_task(task_id).await {
            if done(&task) {
                return task;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("task {task_id} did not reach the expected state, last seen {task:?}");
            }
        } else if tokio::time::Instant::now() >= deadline {
            panic!("task {task_id} not found before timeout");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_terminal(sink: &dyn StatusSink, task_id: Uuid) -> Task {
    wait_for_task(sink, task_id, Duration::from_secs(5), Task::is_terminal).await
}
