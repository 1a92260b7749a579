//! Broker client implementations

pub mod in_memory_client;
pub mod traits;

pub use in_memory_client::InMemoryBroker;
pub use traits::{MessageBroker, QueueMetrics, QueuedMessage};
