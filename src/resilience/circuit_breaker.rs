//! # Circuit Breaker
//!
//! Classic three-state breaker: `Closed` lets calls through, `Open` fails fast until the
//! timeout elapses, `HalfOpen` admits a limited number of probes and closes again once
//! enough of them succeed. Any failed probe reopens the circuit.

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

#[derive(Debug)]
struct BreakerInner {
    metrics: CircuitBreakerMetrics,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            timeout_ms = config.timeout.as_millis() as u64,
            success_threshold = config.success_threshold,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            inner: Mutex::new(BreakerInner {
                metrics: CircuitBreakerMetrics::new(),
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` under breaker protection
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire().await {
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        }

        let started = Instant::now();
        let result = operation().await;
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => self.record_success(elapsed).await,
            Err(_) => self.record_failure(elapsed).await,
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Decide whether a call may proceed, moving `Open -> HalfOpen` once the timeout
    /// has elapsed. Half-open probes are counted here so concurrent callers cannot
    /// exceed the probe budget.
    async fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.timeout)
                    .unwrap_or(true);
                if elapsed {
                    self.set_state(CircuitState::HalfOpen);
                    inner.metrics.half_open_calls = 1;
                    info!(
                        component = %self.name,
                        success_threshold = self.config.success_threshold,
                        "🟡 Circuit breaker half-open (testing recovery)"
                    );
                    true
                } else {
                    inner.metrics.rejected_count += 1;
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.metrics.half_open_calls < u64::from(self.config.success_threshold) {
                    inner.metrics.half_open_calls += 1;
                    true
                } else {
                    inner.metrics.rejected_count += 1;
                    false
                }
            }
        }
    }

    async fn record_success(&self, duration: Duration) {
        let mut inner = self.inner.lock().await;
        let metrics = &mut inner.metrics;
        metrics.total_calls += 1;
        metrics.success_count += 1;
        metrics.total_duration += duration;
        metrics.consecutive_failures = 0;

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🟢 Operation succeeded"
        );

        if self.state() == CircuitState::HalfOpen {
            let successes_needed = u64::from(self.config.success_threshold);
            // Probes are admitted in order, so the last admitted probe closes the circuit
            if metrics.half_open_calls >= successes_needed {
                self.close(&mut inner);
            }
        }
    }

    async fn record_failure(&self, duration: Duration) {
        let mut inner = self.inner.lock().await;
        let metrics = &mut inner.metrics;
        metrics.total_calls += 1;
        metrics.failure_count += 1;
        metrics.total_duration += duration;
        metrics.consecutive_failures += 1;

        warn!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            consecutive_failures = metrics.consecutive_failures,
            "🔴 Operation failed"
        );

        let should_open = match self.state() {
            CircuitState::Closed => {
                metrics.consecutive_failures >= u64::from(self.config.failure_threshold)
            }
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if should_open {
            self.open(&mut inner);
        }
    }

    fn set_state(&self, state: CircuitState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn open(&self, inner: &mut BreakerInner) {
        self.set_state(CircuitState::Open);
        inner.opened_at = Some(Instant::now());
        inner.metrics.half_open_calls = 0;
        warn!(
            component = %self.name,
            consecutive_failures = inner.metrics.consecutive_failures,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "🔴 Circuit breaker opened (failing fast)"
        );
    }

    fn close(&self, inner: &mut BreakerInner) {
        self.set_state(CircuitState::Closed);
        inner.opened_at = None;
        inner.metrics.half_open_calls = 0;
        inner.metrics.consecutive_failures = 0;
        info!(
            component = %self.name,
            total_calls = inner.metrics.total_calls,
            "🟢 Circuit breaker closed (recovered)"
        );
    }

    pub async fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        let mut inner = self.inner.lock().await;
        self.open(&mut inner);
    }

    pub async fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        let mut inner = self.inner.lock().await;
        self.close(&mut inner);
    }

    /// Snapshot with derived rates filled in
    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock().await;
        let mut snapshot = inner.metrics.clone();
        snapshot.current_state = self.state();
        if snapshot.total_calls > 0 {
            snapshot.failure_rate = snapshot.failure_count as f64 / snapshot.total_calls as f64;
        }
        snapshot
    }
}
