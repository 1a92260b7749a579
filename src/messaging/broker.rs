//! # Broker Handle
//!
//! Owned handle over the (optional) broker with a cached health flag. Queue channels
//! consult [`BrokerHandle::healthy`] on every enqueue to pick broker or inline mode.
//! The flag is set by [`BrokerHandle::connect`] and only changes on an explicit
//! [`BrokerHandle::reconnect`].

use crate::messaging::clients::MessageBroker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub struct BrokerHandle {
    broker: Option<Arc<dyn MessageBroker>>,
    healthy: AtomicBool,
}

impl BrokerHandle {
    /// Handle over a broker. Reports unhealthy until [`connect`](Self::connect) succeeds.
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker: Some(broker),
            healthy: AtomicBool::new(false),
        }
    }

    /// Handle with no broker at all; every channel runs inline
    pub fn unavailable() -> Self {
        Self {
            broker: None,
            healthy: AtomicBool::new(false),
        }
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn broker(&self) -> Option<&Arc<dyn MessageBroker>> {
        self.broker.as_ref()
    }

    /// Probe the broker and cache the result
    pub async fn connect(&self) -> bool {
        let healthy = match &self.broker {
            Some(broker) => match broker.ping().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "⚠️ Broker unreachable, channels will run inline");
                    false
                }
            },
            None => false,
        };
        self.healthy.store(healthy, Ordering::Release);
        healthy
    }

    /// Re-probe the broker, logging a mode change
    pub async fn reconnect(&self) -> bool {
        let was_healthy = self.healthy();
        let healthy = self.connect().await;
        if healthy != was_healthy {
            info!(
                healthy,
                "🔄 Broker health changed, dispatch mode is now {}",
                if healthy { "broker" } else { "inline" }
            );
        }
        healthy
    }
}

impl std::fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("has_broker", &self.broker.is_some())
            .field("healthy", &self.healthy())
            .finish()
    }
}
