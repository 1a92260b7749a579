//! # Circuit-Breaker Protected Broker
//!
//! Wraps any [`MessageBroker`] so that every operation runs through a shared
//! [`CircuitBreaker`]. Once the breaker opens, calls fail fast with
//! [`MessagingError::CircuitBreakerOpen`] until the recovery timeout elapses.

use crate::messaging::clients::{MessageBroker, QueueMetrics, QueuedMessage};
use crate::messaging::errors::MessagingResult;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub struct ProtectedBroker {
    inner: Arc<dyn MessageBroker>,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl ProtectedBroker {
    pub fn new(inner: Arc<dyn MessageBroker>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            circuit_breaker: Arc::new(CircuitBreaker::new("broker", config)),
        }
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub async fn circuit_breaker_metrics(&self) -> CircuitBreakerMetrics {
        self.circuit_breaker.metrics().await
    }
}

impl std::fmt::Debug for ProtectedBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedBroker")
            .field("circuit_state", &self.circuit_state())
            .finish()
    }
}

#[async_trait]
impl MessageBroker for ProtectedBroker {
    async fn create_queue(&self, queue_name: &str) -> MessagingResult<()> {
        Ok(self
            .circuit_breaker
            .call(|| self.inner.create_queue(queue_name))
            .await?)
    }

    async fn send(&self, queue_name: &str, payload: Value, priority: u8) -> MessagingResult<i64> {
        Ok(self
            .circuit_breaker
            .call(|| self.inner.send(queue_name, payload, priority))
            .await?)
    }

    async fn receive(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> MessagingResult<Vec<QueuedMessage>> {
        Ok(self
            .circuit_breaker
            .call(|| self.inner.receive(queue_name, visibility_timeout, limit))
            .await?)
    }

    async fn delete_message(&self, queue_name: &str, message_id: i64) -> MessagingResult<()> {
        Ok(self
            .circuit_breaker
            .call(|| self.inner.delete_message(queue_name, message_id))
            .await?)
    }

    async fn release_message(
        &self,
        queue_name: &str,
        message_id: i64,
        delay: Duration,
    ) -> MessagingResult<()> {
        Ok(self
            .circuit_breaker
            .call(|| self.inner.release_message(queue_name, message_id, delay))
            .await?)
    }

    async fn archive_message(&self, queue_name: &str, message_id: i64) -> MessagingResult<()> {
        Ok(self
            .circuit_breaker
            .call(|| self.inner.archive_message(queue_name, message_id))
            .await?)
    }

    async fn ping(&self) -> MessagingResult<()> {
        Ok(self.circuit_breaker.call(|| self.inner.ping()).await?)
    }

    async fn queue_metrics(&self, queue_name: &str) -> MessagingResult<QueueMetrics> {
        Ok(self
            .circuit_breaker
            .call(|| self.inner.queue_metrics(queue_name))
            .await?)
    }
}
