//! # Resilience
//!
//! Circuit breaker used to protect broker operations. When the broker keeps failing,
//! the breaker opens and sends fail fast instead of piling up on a dead connection;
//! the orchestrator surfaces those as dispatch failures and the task stays `pending`.

pub mod circuit_breaker;
pub mod config;
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::CircuitBreakerConfig;
pub use metrics::CircuitBreakerMetrics;
