//! # Queue Worker
//!
//! Broker-mode consumer for one channel. A single poll loop leases batches from the
//! channel's queue and spawns one tokio task per message, bounded by a semaphore.
//! The loop skips polling while the broker handle reports unhealthy.

use crate::config::QueueConfig;
use crate::logging::log_queue_operation;
use crate::messaging::{JobMessage, MessageBroker, QueuedMessage};
use crate::queue::channel::QueueChannel;
use crate::queue::handler::{DeliveryContext, HandlerOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Polling and concurrency settings for a [`QueueWorker`]
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Jobs allowed in flight at once
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// How long a leased message stays invisible to other readers
    pub visibility_timeout: Duration,
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(250),
            visibility_timeout: Duration::from_secs(300),
            batch_size: 10,
        }
    }
}

impl From<&QueueConfig> for WorkerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            visibility_timeout: Duration::from_secs(config.visibility_timeout_seconds),
            batch_size: config.batch_size.max(1),
        }
    }
}

pub struct QueueWorker {
    channel: Arc<QueueChannel>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl QueueWorker {
    pub fn new(channel: Arc<QueueChannel>, config: WorkerConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            channel,
            config,
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Worker whose shutdown follows `parent`
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = parent.child_token();
        self
    }

    pub fn channel(&self) -> &Arc<QueueChannel> {
        &self.channel
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && self.tasks.lock().is_some()
    }

    /// Jobs currently being handled
    pub fn in_flight(&self) -> usize {
        self.config.concurrency.max(1) - self.semaphore.available_permits()
    }

    /// Spawn the poll loop. Does nothing when the channel has no broker.
    pub fn start(&self) {
        let Some(broker) = self.channel.broker().broker().cloned() else {
            debug!(queue = %self.channel.queue_name(), "No broker configured, worker not started");
            return;
        };

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!(queue = %self.channel.queue_name(), "Worker already stopped");
            return;
        };

        info!(
            queue = %self.channel.queue_name(),
            kind = %self.channel.kind(),
            concurrency = self.config.concurrency,
            "🚀 Starting queue worker"
        );

        join_set.spawn(poll_loop(
            self.channel.clone(),
            broker,
            self.config.clone(),
            self.semaphore.clone(),
            self.shutdown.clone(),
        ));
    }

    /// Stop polling and wait for in-flight jobs, up to `timeout`
    pub async fn stop(&self, timeout: Duration) {
        self.shutdown.cancel();
        let join_set = self.tasks.lock().take();

        if let Some(mut join_set) = join_set {
            let drained = tokio::time::timeout(timeout, async {
                while join_set.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    queue = %self.channel.queue_name(),
                    "Worker did not drain within {:?}, aborting", timeout
                );
                join_set.abort_all();
            }
        }
        info!(queue = %self.channel.queue_name(), "🛑 Queue worker stopped");
    }
}

impl std::fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("queue", &self.channel.queue_name())
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn poll_loop(
    channel: Arc<QueueChannel>,
    broker: Arc<dyn MessageBroker>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    let queue = channel.queue_name().to_string();
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(queue = %queue, error = %e, "Job task panicked");
                }
                continue;
            }
            _ = tokio::time::sleep(config.poll_interval) => {}
        }

        if !channel.broker().healthy() {
            continue;
        }
        let free = semaphore.available_permits();
        if free == 0 {
            continue;
        }

        let messages = match broker
            .receive(&queue, config.visibility_timeout, free.min(config.batch_size))
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!(queue = %queue, error = %e, "Failed to receive messages");
                continue;
            }
        };

        for message in messages {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let channel = channel.clone();
            let broker = broker.clone();
            in_flight.spawn(async move {
                process_message(&channel, broker.as_ref(), message).await;
                drop(permit);
            });
        }
    }

    // finish what was leased; the visibility timeout covers anything cut off by stop()
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(queue = %queue, error = %e, "Job task panicked");
        }
    }
    debug!(queue = %queue, "Poll loop exited");
}

/// Deliver one leased message to the channel's handler and settle it with the broker
pub(crate) async fn process_message(
    channel: &QueueChannel,
    broker: &dyn MessageBroker,
    message: QueuedMessage,
) {
    let queue = channel.queue_name();
    let message_id = message.message_id;

    let job = match JobMessage::from_json(message.payload) {
        Ok(job) => job,
        Err(e) => {
            error!(queue = %queue, message_id, error = %e, "Undecodable job message, archiving");
            settle(broker, queue, message_id, Settlement::Archive).await;
            return;
        }
    };

    let Some(handler) = channel.handler() else {
        warn!(queue = %queue, task_id = %job.task_id, "No handler bound, releasing message");
        settle(broker, queue, message_id, Settlement::Release(Duration::from_secs(1))).await;
        return;
    };

    let policy = channel.policy_for(&job);
    let attempt = message.read_count.max(1);

    let settlement = if attempt > policy.max_attempts {
        // redelivered after the lease expired on its last allowed attempt
        handler
            .abandon(&job, &format!("gave up after {} attempts", policy.max_attempts))
            .await;
        Settlement::Archive
    } else {
        match handler.handle(&job, DeliveryContext::broker(attempt, policy)).await {
            HandlerOutcome::Retry { delay, .. } => Settlement::Release(delay),
            HandlerOutcome::Failed { .. } => Settlement::Archive,
            HandlerOutcome::Completed { .. }
            | HandlerOutcome::Cancelled
            | HandlerOutcome::Skipped { .. } => Settlement::Delete,
        }
    };

    settle(broker, queue, message_id, settlement).await;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Settlement {
    Delete,
    Release(Duration),
    Archive,
}

async fn settle(broker: &dyn MessageBroker, queue: &str, message_id: i64, settlement: Settlement) {
    let (operation, result) = match settlement {
        Settlement::Delete => ("delete", broker.delete_message(queue, message_id).await),
        Settlement::Release(delay) => (
            "release",
            broker.release_message(queue, message_id, delay).await,
        ),
        Settlement::Archive => ("archive", broker.archive_message(queue, message_id).await),
    };

    match result {
        Ok(()) => log_queue_operation(operation, queue, Some(message_id), "success", None),
        Err(e) => log_queue_operation(
            operation,
            queue,
            Some(message_id),
            "error",
            Some(&e.to_string()),
        ),
    }
}
