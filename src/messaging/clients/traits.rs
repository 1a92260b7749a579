use crate::messaging::errors::MessagingResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A message leased from a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message_id: i64,
    pub payload: Value,
    /// Deliveries so far, including this one
    pub read_count: u32,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queue_name: String,
    /// Messages waiting to be delivered
    pub visible_count: u64,
    /// Messages currently leased by a consumer
    pub in_flight_count: u64,
    pub archived_count: u64,
    pub oldest_message_age_seconds: Option<i64>,
}

/// Broker operations used by queue channels and workers
///
/// Delivery is at-least-once: a leased message that is neither deleted, released nor
/// archived becomes visible again when its visibility timeout lapses.
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Create the queue if it doesn't exist
    async fn create_queue(&self, queue_name: &str) -> MessagingResult<()>;

    /// Enqueue a JSON payload, returning the broker's message id
    async fn send(&self, queue_name: &str, payload: Value, priority: u8) -> MessagingResult<i64>;

    /// Lease up to `limit` visible messages for `visibility_timeout`
    async fn receive(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> MessagingResult<Vec<QueuedMessage>>;

    /// Acknowledge and drop a message
    async fn delete_message(&self, queue_name: &str, message_id: i64) -> MessagingResult<()>;

    /// Return a leased message to the queue, visible again after `delay`
    async fn release_message(
        &self,
        queue_name: &str,
        message_id: i64,
        delay: Duration,
    ) -> MessagingResult<()>;

    /// Move a message to the queue's archive (dead letter)
    async fn archive_message(&self, queue_name: &str, message_id: i64) -> MessagingResult<()>;

    /// Connectivity check
    async fn ping(&self) -> MessagingResult<()>;

    async fn queue_metrics(&self, queue_name: &str) -> MessagingResult<QueueMetrics>;
}
