//! # In-Memory Broker
//!
//! Process-local [`MessageBroker`] with lease/visibility semantics. Used by tests and by
//! single-process deployments that still want queued, retried execution.
//!
//! Delivery order is highest priority first, FIFO within a priority. Availability can
//! be toggled and send failures injected to exercise fallback and circuit-breaker paths.

use super::traits::{MessageBroker, QueueMetrics, QueuedMessage};
use crate::messaging::errors::{MessagingError, MessagingResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const MAX_QUEUE_NAME_LEN: usize = 48;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    payload: Value,
    priority: u8,
    read_count: u32,
    enqueued_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    leased: bool,
}

#[derive(Debug, Default)]
struct InMemoryQueue {
    messages: Vec<StoredMessage>,
    archive: Vec<StoredMessage>,
    next_id: i64,
}

impl InMemoryQueue {
    fn position(&self, queue_name: &str, message_id: i64) -> MessagingResult<usize> {
        self.messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| MessagingError::message_not_found(queue_name, message_id))
    }
}

#[derive(Debug)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, InMemoryQueue>>,
    available: AtomicBool,
    failing_sends: AtomicU32,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            failing_sends: AtomicU32::new(0),
        }
    }

    /// Simulate the broker going away or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Make the next `count` sends fail with a queue operation error
    pub fn fail_next_sends(&self, count: u32) {
        self.failing_sends.store(count, Ordering::Release);
    }

    /// Archived payloads for a queue, oldest first
    pub async fn archived(&self, queue_name: &str) -> Vec<Value> {
        self.queues
            .lock()
            .await
            .get(queue_name)
            .map(|q| q.archive.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    fn ensure_available(&self) -> MessagingResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(MessagingError::broker_unavailable("in-memory broker is offline"))
        }
    }

    fn validate_queue_name(queue_name: &str) -> MessagingResult<()> {
        if queue_name.is_empty() {
            return Err(MessagingError::invalid_queue_name(queue_name, "empty"));
        }
        if queue_name.len() > MAX_QUEUE_NAME_LEN {
            return Err(MessagingError::invalid_queue_name(
                queue_name,
                format!("longer than {MAX_QUEUE_NAME_LEN} characters"),
            ));
        }
        if !queue_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(MessagingError::invalid_queue_name(
                queue_name,
                "only ASCII letters, digits and underscores are allowed",
            ));
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_sends
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn create_queue(&self, queue_name: &str) -> MessagingResult<()> {
        self.ensure_available()?;
        Self::validate_queue_name(queue_name)?;
        self.queues
            .lock()
            .await
            .entry(queue_name.to_string())
            .or_default();
        Ok(())
    }

    async fn send(&self, queue_name: &str, payload: Value, priority: u8) -> MessagingResult<i64> {
        self.ensure_available()?;
        if self.take_injected_failure() {
            return Err(MessagingError::queue_operation(
                queue_name,
                "send",
                "injected failure",
            ));
        }

        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        queue.next_id += 1;
        let now = Utc::now();
        queue.messages.push(StoredMessage {
            id: queue.next_id,
            payload,
            priority,
            read_count: 0,
            enqueued_at: now,
            visible_at: now,
            leased: false,
        });
        debug!(queue = %queue_name, message_id = queue.next_id, priority, "Message enqueued");
        Ok(queue.next_id)
    }

    async fn receive(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> MessagingResult<Vec<QueuedMessage>> {
        self.ensure_available()?;
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        let now = Utc::now();
        let lease_until = now
            + chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let mut visible: Vec<usize> = queue
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(index, _)| index)
            .collect();
        visible.sort_by(|&a, &b| {
            let (a, b) = (&queue.messages[a], &queue.messages[b]);
            b.priority.cmp(&a.priority).then(a.id.cmp(&b.id))
        });

        let mut leased = Vec::new();
        for index in visible.into_iter().take(limit) {
            let message = &mut queue.messages[index];
            message.read_count += 1;
            message.visible_at = lease_until;
            message.leased = true;
            leased.push(QueuedMessage {
                message_id: message.id,
                payload: message.payload.clone(),
                read_count: message.read_count,
                priority: message.priority,
                enqueued_at: message.enqueued_at,
            });
        }
        Ok(leased)
    }

    async fn delete_message(&self, queue_name: &str, message_id: i64) -> MessagingResult<()> {
        self.ensure_available()?;
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;
        let index = queue.position(queue_name, message_id)?;
        queue.messages.remove(index);
        Ok(())
    }

    async fn release_message(
        &self,
        queue_name: &str,
        message_id: i64,
        delay: Duration,
    ) -> MessagingResult<()> {
        self.ensure_available()?;
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;
        let index = queue.position(queue_name, message_id)?;

        let message = &mut queue.messages[index];
        message.visible_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        message.leased = false;
        Ok(())
    }

    async fn archive_message(&self, queue_name: &str, message_id: i64) -> MessagingResult<()> {
        self.ensure_available()?;
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;
        let index = queue.position(queue_name, message_id)?;
        let message = queue.messages.remove(index);
        queue.archive.push(message);
        Ok(())
    }

    async fn ping(&self) -> MessagingResult<()> {
        self.ensure_available()
    }

    async fn queue_metrics(&self, queue_name: &str) -> MessagingResult<QueueMetrics> {
        self.ensure_available()?;
        let queues = self.queues.lock().await;
        let queue = queues
            .get(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        let now = Utc::now();
        let in_flight = queue
            .messages
            .iter()
            .filter(|m| m.leased && m.visible_at > now)
            .count() as u64;
        Ok(QueueMetrics {
            queue_name: queue_name.to_string(),
            visible_count: queue.messages.len() as u64 - in_flight,
            in_flight_count: in_flight,
            archived_count: queue.archive.len() as u64,
            oldest_message_age_seconds: queue
                .messages
                .iter()
                .map(|m| m.enqueued_at)
                .min()
                .map(|oldest| (now - oldest).num_seconds()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VT: Duration = Duration::from_secs(30);

    async fn broker_with_queue(name: &str) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.create_queue(name).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_create_queue_is_idempotent() {
        let broker = broker_with_queue("acquire_queue").await;
        broker.send("acquire_queue", json!(1), 0).await.unwrap();
        broker.create_queue("acquire_queue").await.unwrap();

        let metrics = broker.queue_metrics("acquire_queue").await.unwrap();
        assert_eq!(metrics.visible_count, 1);
    }

    #[tokio::test]
    async fn test_invalid_queue_names() {
        let broker = InMemoryBroker::new();
        assert!(broker.create_queue("").await.is_err());
        assert!(broker.create_queue("has-dash").await.is_err());
        assert!(broker.create_queue(&"q".repeat(49)).await.is_err());
    }

    #[tokio::test]
    async fn test_priority_then_fifo_delivery() {
        let broker = broker_with_queue("q").await;
        broker.send("q", json!("low-1"), 0).await.unwrap();
        broker.send("q", json!("high"), 5).await.unwrap();
        broker.send("q", json!("low-2"), 0).await.unwrap();

        let received = broker.receive("q", VT, 10).await.unwrap();
        let order: Vec<_> = received.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(order, vec![json!("high"), json!("low-1"), json!("low-2")]);
    }

    #[tokio::test]
    async fn test_leased_messages_are_hidden_until_released() {
        let broker = broker_with_queue("q").await;
        let id = broker.send("q", json!("job"), 0).await.unwrap();

        let first = broker.receive("q", VT, 1).await.unwrap();
        assert_eq!(first[0].read_count, 1);
        assert!(broker.receive("q", VT, 1).await.unwrap().is_empty());

        broker.release_message("q", id, Duration::ZERO).await.unwrap();
        let second = broker.receive("q", VT, 1).await.unwrap();
        assert_eq!(second[0].message_id, id);
        assert_eq!(second[0].read_count, 2);
    }

    #[tokio::test]
    async fn test_archive_moves_to_dead_letter() {
        let broker = broker_with_queue("q").await;
        let id = broker.send("q", json!({"task": 1}), 0).await.unwrap();
        broker.receive("q", VT, 1).await.unwrap();
        broker.archive_message("q", id).await.unwrap();

        let metrics = broker.queue_metrics("q").await.unwrap();
        assert_eq!(metrics.visible_count + metrics.in_flight_count, 0);
        assert_eq!(metrics.archived_count, 1);
        assert_eq!(broker.archived("q").await, vec![json!({"task": 1})]);
    }

    #[tokio::test]
    async fn test_unavailable_broker_rejects_operations() {
        let broker = broker_with_queue("q").await;
        broker.set_available(false);

        assert!(broker.ping().await.is_err());
        let err = broker.send("q", json!(1), 0).await.unwrap_err();
        assert!(err.is_connectivity());

        broker.set_available(true);
        assert!(broker.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_send_failures() {
        let broker = broker_with_queue("q").await;
        broker.fail_next_sends(2);

        assert!(broker.send("q", json!(1), 0).await.is_err());
        assert!(broker.send("q", json!(2), 0).await.is_err());
        assert!(broker.send("q", json!(3), 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_send_to_missing_queue() {
        let broker = InMemoryBroker::new();
        let err = broker.send("missing", json!(1), 0).await.unwrap_err();
        assert!(matches!(err, MessagingError::QueueNotFound { .. }));
    }
}
