//! # Pipeline Bootstrap
//!
//! Wires a [`PipelineSystem`] from configuration, a status sink, an optional broker and
//! the stage executors:
//!
//! - the broker is wrapped in a circuit breaker and probed once; the result decides
//!   broker or inline mode until [`PipelineSystem::reconnect`]
//! - one channel per task kind, each bound to a handler that chains completed stages
//! - one [`QueueWorker`] per bound channel when a broker is configured

use crate::config::{ConfigManager, PipelineConfig};
use crate::error::OrchestrationResult;
use crate::messaging::{BrokerHandle, MessageBroker, ProtectedBroker};
use crate::orchestration::chaining::StageChainer;
use crate::orchestration::orchestrator::PipelineOrchestrator;
use crate::queue::{CancellationRegistry, ChannelRegistry, QueueWorker, StageJobHandler, WorkerConfig};
use crate::stages::StageExecutors;
use crate::status_sink::StatusSink;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Snapshot of a running system
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStatus {
    pub environment: String,
    pub broker_healthy: bool,
    pub workers: usize,
    pub in_flight_jobs: usize,
    pub shut_down: bool,
}

pub struct PipelineSystem {
    config: PipelineConfig,
    orchestrator: Arc<PipelineOrchestrator>,
    channels: Arc<ChannelRegistry>,
    broker: Arc<BrokerHandle>,
    workers: Vec<QueueWorker>,
    shutdown: CancellationToken,
}

impl PipelineSystem {
    pub async fn bootstrap(
        config: PipelineConfig,
        sink: Arc<dyn StatusSink>,
        broker: Option<Arc<dyn MessageBroker>>,
        executors: StageExecutors,
    ) -> OrchestrationResult<Self> {
        config.validate()?;
        info!(environment = %config.environment, "🚀 BOOTSTRAP: Starting pipeline system");

        let broker = match broker {
            Some(broker) if config.broker.enabled => {
                let protected =
                    ProtectedBroker::new(broker, config.broker.circuit_breaker.clone());
                let handle = BrokerHandle::new(Arc::new(protected));
                handle.connect().await;
                handle
            }
            Some(_) => {
                info!("Broker disabled by configuration, running inline");
                BrokerHandle::unavailable()
            }
            None => BrokerHandle::unavailable(),
        };
        let broker = Arc::new(broker);
        info!(healthy = broker.healthy(), "🛡️ BOOTSTRAP: Broker probed");

        let channels = Arc::new(ChannelRegistry::from_config(&config.queues, broker.clone()));
        channels.initialize_queues().await?;

        let cancellations = CancellationRegistry::new();
        let chainer = Arc::new(StageChainer::new(sink.clone(), Arc::downgrade(&channels)));
        let executors = executors.with_derived_composite();

        let shutdown = CancellationToken::new();
        let mut workers = Vec::new();
        for kind in executors.kinds() {
            let Some(executor) = executors.get(kind) else {
                continue;
            };
            let channel = channels.channel(kind)?;
            let handler = StageJobHandler::new(kind, executor, sink.clone(), cancellations.clone())
                .with_listener(chainer.clone());
            channel.bind(Arc::new(handler));

            if broker.broker().is_some() {
                let worker_config = WorkerConfig::from(config.queues.for_kind(kind));
                let worker = QueueWorker::new(channel, worker_config).with_parent_token(&shutdown);
                worker.start();
                workers.push(worker);
            }
        }
        for kind in crate::models::TaskKind::ALL {
            if executors.get(kind).is_none() {
                warn!(kind = %kind, "No executor registered; tasks of this kind will fail to dispatch");
            }
        }

        let orchestrator = Arc::new(PipelineOrchestrator::new(
            sink,
            channels.clone(),
            cancellations,
            &config.admission,
        ));

        info!(
            workers = workers.len(),
            mode = if broker.healthy() { "broker" } else { "inline" },
            "✅ BOOTSTRAP: Pipeline system ready"
        );

        Ok(Self {
            config,
            orchestrator,
            channels,
            broker,
            workers,
            shutdown,
        })
    }

    /// Bootstrap from a loaded [`ConfigManager`]
    pub async fn from_config_manager(
        manager: &ConfigManager,
        sink: Arc<dyn StatusSink>,
        broker: Option<Arc<dyn MessageBroker>>,
        executors: StageExecutors,
    ) -> OrchestrationResult<Self> {
        Self::bootstrap(manager.config().clone(), sink, broker, executors).await
    }

    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    pub fn broker(&self) -> &Arc<BrokerHandle> {
        &self.broker
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Re-probe the broker. Queues are (re)created when it is reachable.
    pub async fn reconnect(&self) -> OrchestrationResult<bool> {
        let healthy = self.broker.reconnect().await;
        if healthy {
            self.channels.initialize_queues().await?;
        }
        Ok(healthy)
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            environment: self.config.environment.clone(),
            broker_healthy: self.broker.healthy(),
            workers: self.workers.iter().filter(|w| w.is_running()).count(),
            in_flight_jobs: self.workers.iter().map(QueueWorker::in_flight).sum(),
            shut_down: self.shutdown.is_cancelled(),
        }
    }

    /// Stop polling and wait for in-flight jobs, bounded by `broker.shutdown_timeout_seconds`
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("🛑 Shutting down pipeline system");
        self.shutdown.cancel();
        let timeout = self.config.broker.shutdown_timeout();
        futures::future::join_all(self.workers.iter().map(|w| w.stop(timeout))).await;
        info!("Pipeline system stopped");
    }
}

impl std::fmt::Debug for PipelineSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSystem")
            .field("status", &self.status())
            .finish()
    }
}
