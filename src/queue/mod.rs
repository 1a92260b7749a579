//! # Queue Channels
//!
//! Per-stage dispatch. A [`QueueChannel`] either sends jobs to the broker, where a
//! [`QueueWorker`] picks them up, or runs them inline when the broker is unavailable.
//! Both paths go through the same [`StageJobHandler`].

pub mod cancellation;
pub mod channel;
pub mod handler;
pub mod registry;
pub mod retry;
pub mod worker;

pub use cancellation::CancellationRegistry;
pub use channel::{DispatchMode, EnqueueOptions, EnqueueReceipt, QueueChannel};
pub use handler::{CompletionListener, DeliveryContext, HandlerOutcome, StageJobHandler};
pub use registry::ChannelRegistry;
pub use retry::{RetryDecision, RetryPolicy};
pub use worker::{QueueWorker, WorkerConfig};
