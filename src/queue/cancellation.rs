use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Cancellation tokens for tasks with a handler in flight.
///
/// Handlers register a token before they read the task record and remove it when they
/// finish; the orchestrator persists `cancelled` first and then cancels through the
/// registry. Either the handler sees the terminal status or its token gets cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<DashMap<Uuid, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `task_id`, created on first use
    pub fn register(&self, task_id: Uuid) -> CancellationToken {
        self.tokens.entry(task_id).or_default().clone()
    }

    /// Cancel the running handler's token, if any. Returns whether one was found.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        match self.tokens.get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, task_id: Uuid) -> bool {
        self.tokens
            .get(&task_id)
            .map(|token| token.is_cancelled())
            .unwrap_or(false)
    }

    pub fn remove(&self, task_id: Uuid) {
        self.tokens.remove(&task_id);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
