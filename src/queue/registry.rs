use crate::config::QueuesConfig;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::messaging::BrokerHandle;
use crate::models::TaskKind;
use crate::queue::channel::QueueChannel;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Maps each [`TaskKind`] to its channel. Built once at startup.
#[derive(Debug)]
pub struct ChannelRegistry {
    channels: HashMap<TaskKind, Arc<QueueChannel>>,
    broker: Arc<BrokerHandle>,
}

impl ChannelRegistry {
    /// One channel per kind, named and tuned from `queues`
    pub fn from_config(queues: &QueuesConfig, broker: Arc<BrokerHandle>) -> Self {
        let channels = TaskKind::ALL
            .into_iter()
            .map(|kind| {
                let channel = QueueChannel::from_config(kind, queues.for_kind(kind), broker.clone());
                (kind, Arc::new(channel))
            })
            .collect();
        Self { channels, broker }
    }

    pub fn channel(&self, kind: TaskKind) -> OrchestrationResult<Arc<QueueChannel>> {
        self.channels.get(&kind).cloned().ok_or_else(|| {
            OrchestrationError::Configuration(format!("no queue channel for task kind {kind}"))
        })
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<QueueChannel>> {
        self.channels.values()
    }

    pub fn broker(&self) -> &Arc<BrokerHandle> {
        &self.broker
    }

    /// Create every channel's broker queue. Idempotent; a no-op without a healthy broker.
    pub async fn initialize_queues(&self) -> OrchestrationResult<()> {
        let Some(broker) = self.broker.broker() else {
            return Ok(());
        };
        if !self.broker.healthy() {
            warn!("Broker unhealthy, skipping queue creation");
            return Ok(());
        }

        for channel in self.channels.values() {
            broker.create_queue(channel.queue_name()).await?;
            info!(queue = %channel.queue_name(), kind = %channel.kind(), "✅ Queue ready");
        }
        Ok(())
    }
}
