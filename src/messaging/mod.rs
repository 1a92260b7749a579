//! # Messaging
//!
//! Job messages and the broker seam: the [`MessageBroker`] trait, an in-memory
//! implementation, a circuit-breaker wrapper and the [`BrokerHandle`] that caches
//! broker health for the queue channels.

pub mod broker;
pub mod clients;
pub mod errors;
pub mod message;
pub mod protected_client;

pub use broker::BrokerHandle;
pub use clients::{InMemoryBroker, MessageBroker, QueueMetrics, QueuedMessage};
pub use errors::{MessagingError, MessagingResult};
pub use message::{JobMessage, JobMetadata, StagePayload};
pub use protected_client::ProtectedBroker;
