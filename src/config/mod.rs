//! # Configuration
//!
//! Typed configuration for the pipeline core. Every section is `#[serde(default)]`, so
//! a configuration file only needs the values that differ from the defaults below.
//! Loading and layering (defaults, TOML file, `CONVEYOR__*` environment variables)
//! lives in [`ConfigManager`].

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use crate::constants::{default_queue_name, system};
use crate::models::TaskKind;
use crate::queue::RetryPolicy;
use crate::resilience::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub environment: String,
    pub admission: AdmissionConfig,
    pub broker: BrokerConfig,
    pub queues: QueuesConfig,
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environment: system::DEFAULT_ENVIRONMENT.to_string(),
            admission: AdmissionConfig::default(),
            broker: BrokerConfig::default(),
            queues: QueuesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.environment.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "environment",
                &self.environment,
                "must not be empty",
            ));
        }

        if self.admission.default_daily_quota == Some(0) {
            tracing::warn!("admission.default_daily_quota is 0; tenants without a quota are always denied");
        }

        self.broker
            .circuit_breaker
            .validate()
            .map_err(|e| ConfigurationError::invalid_value("broker.circuit_breaker", "", e))?;
        if self.broker.shutdown_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "broker.shutdown_timeout_seconds",
                "0",
                "must be greater than 0",
            ));
        }

        let mut names = HashSet::new();
        for kind in TaskKind::ALL {
            let queue = self.queues.for_kind(kind);
            queue.validate(kind)?;
            if !names.insert(queue.name.as_str()) {
                return Err(ConfigurationError::invalid_value(
                    format!("queues.{kind}.name"),
                    &queue.name,
                    "queue names must be unique",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Quota for tenants with no explicit quota row. `None` denies them.
    pub default_daily_quota: Option<u32>,
    /// Check and insert in a single sink call instead of read-then-act
    pub atomic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// When false the broker is never contacted and every channel runs inline
    pub enabled: bool,
    pub circuit_breaker: CircuitBreakerConfig,
    pub shutdown_timeout_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            circuit_breaker: CircuitBreakerConfig::for_broker(),
            shutdown_timeout_seconds: 30,
        }
    }
}

impl BrokerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    pub acquire: QueueConfig,
    pub transform: QueueConfig,
    pub deliver: QueueConfig,
    pub composite: QueueConfig,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            acquire: QueueConfig::named(default_queue_name(TaskKind::Acquire)),
            transform: QueueConfig::named(default_queue_name(TaskKind::Transform)),
            deliver: QueueConfig::named(default_queue_name(TaskKind::Deliver)),
            composite: QueueConfig {
                concurrency: 2,
                ..QueueConfig::named(default_queue_name(TaskKind::Composite))
            },
        }
    }
}

impl QueuesConfig {
    pub fn for_kind(&self, kind: TaskKind) -> &QueueConfig {
        match kind {
            TaskKind::Acquire => &self.acquire,
            TaskKind::Transform => &self.transform,
            TaskKind::Deliver => &self.deliver,
            TaskKind::Composite => &self.composite,
        }
    }

    pub fn for_kind_mut(&mut self, kind: TaskKind) -> &mut QueueConfig {
        match kind {
            TaskKind::Acquire => &mut self.acquire,
            TaskKind::Transform => &mut self.transform,
            TaskKind::Deliver => &mut self.deliver,
            TaskKind::Composite => &mut self.composite,
        }
    }
}

/// Settings for one stage's queue channel and worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub priority: u8,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter_factor: f64,
    pub concurrency: usize,
    pub visibility_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::named("conveyor_default")
    }
}

impl QueueConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            jitter_factor: 0.1,
            concurrency: 4,
            visibility_timeout_seconds: 300,
            poll_interval_ms: 250,
            batch_size: 10,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
        .with_jitter(self.jitter_factor)
    }

    fn validate(&self, kind: TaskKind) -> ConfigResult<()> {
        let field = |name: &str| format!("queues.{kind}.{name}");

        if self.name.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(field("name"), "", "must not be empty"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                field("max_attempts"),
                "0",
                "must be at least 1",
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                field("concurrency"),
                "0",
                "must be at least 1",
            ));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigurationError::invalid_value(
                field("backoff_base_ms"),
                self.backoff_base_ms.to_string(),
                format!("must not exceed backoff_max_ms ({})", self.backoff_max_ms),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigurationError::invalid_value(
                field("jitter_factor"),
                self.jitter_factor.to_string(),
                "must be between 0.0 and 1.0",
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                field("batch_size"),
                "0",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset; defaults by environment
    pub level: Option<String>,
    /// Directory for JSON log files; console only when unset
    pub directory: Option<PathBuf>,
}
