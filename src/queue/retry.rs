//! Attempt bound and exponential backoff for broker-delivered jobs.

use crate::stages::StageError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total handler invocations allowed, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random extra delay as a fraction of the computed delay, `0.0..=1.0`
    pub jitter_factor: f64,
}

/// What to do with a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;

    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter_factor: 0.0,
        }
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// `base * 2^(attempt-1)` capped at `max_delay`, before jitter
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = Self::BACKOFF_MULTIPLIER.powi(exponent);
        let millis = self.base_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// Delay before redelivering after failed attempt number `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_backoff(attempt);
        let jittered = if self.jitter_factor > 0.0 {
            let extra_ms = delay.as_millis() as f64 * fastrand::f64() * self.jitter_factor;
            delay.saturating_add(Duration::from_millis(extra_ms as u64))
        } else {
            delay
        };
        jittered.min(self.max_delay)
    }

    pub fn decide(&self, attempt: u32, error: &StageError) -> RetryDecision {
        if error.is_retryable() && attempt < self.max_attempts {
            RetryDecision::RetryAfter(self.backoff_delay(attempt))
        } else {
            RetryDecision::GiveUp
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(50, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(30));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(10))
            .with_jitter(0.5);
        for _ in 0..100 {
            let delay = policy.backoff_delay(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_decisions() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1));
        let transient = StageError::retryable("socket reset");

        assert_eq!(
            policy.decide(1, &transient),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
        assert!(matches!(policy.decide(2, &transient), RetryDecision::RetryAfter(_)));
        assert_eq!(policy.decide(3, &transient), RetryDecision::GiveUp);
        assert_eq!(
            policy.decide(1, &StageError::permanent("bad codec")),
            RetryDecision::GiveUp
        );
        assert_eq!(policy.decide(1, &StageError::Cancelled), RetryDecision::GiveUp);
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(
            policy.decide(1, &StageError::retryable("x")),
            RetryDecision::GiveUp
        );
    }
}
