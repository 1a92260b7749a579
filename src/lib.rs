#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Conveyor Core
//!
//! Orchestration core for multi-stage content pipelines: acquire media from a source,
//! transform it, deliver it to a destination, on behalf of many tenants with daily
//! quotas.
//!
//! ## Overview
//!
//! The crate decides when work may run, tracks each task's lifecycle durably through a
//! [`StatusSink`](status_sink::StatusSink), reports incremental progress, retries
//! transient failures with exponential backoff, and keeps working when the message
//! broker is unreachable by running stages inline in the caller's task. Callers see the
//! same contract in both modes.
//!
//! ## Module Organization
//!
//! - [`orchestration`] - Admission control, task operations, chaining and bootstrap
//! - [`queue`] - Per-stage channels, job handler, retry policy and broker workers
//! - [`messaging`] - Broker abstraction, in-memory broker and job messages
//! - [`stages`] - Stage executor trait, progress reporting and the composite executor
//! - [`status_sink`] - Task persistence (in-memory and PostgreSQL)
//! - [`state_machine`] - Legal task status transitions
//! - [`resilience`] - Circuit breaker guarding broker calls
//! - [`config`] - Layered configuration
//! - [`error`] - Orchestration errors
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conveyor_core::config::PipelineConfig;
//! use conveyor_core::models::TaskKind;
//! use conveyor_core::orchestration::{CreateTaskRequest, PipelineSystem};
//! use conveyor_core::stages::StageExecutors;
//! use conveyor_core::status_sink::InMemoryStatusSink;
//! use std::sync::Arc;
//!
//! # async fn example(executors: StageExecutors) -> Result<(), Box<dyn std::error::Error>> {
//! let sink = Arc::new(InMemoryStatusSink::new());
//! sink.set_quota("tenant-a", 100);
//!
//! // No broker: every stage runs inline
//! let system = PipelineSystem::bootstrap(PipelineConfig::default(), sink, None, executors).await?;
//! let task = system
//!     .orchestrator()
//!     .create_task(CreateTaskRequest::new("tenant-a", TaskKind::Acquire))
//!     .await?;
//! println!("task {} is {}", task.task_id, task.status);
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod queue;
pub mod resilience;
pub mod stages;
pub mod state_machine;
pub mod status_sink;

pub use config::{ConfigManager, PipelineConfig};
pub use error::{DenialReason, OrchestrationError, OrchestrationResult};
pub use models::{NewTask, Task, TaskKind, TaskStatusUpdate, TenantId};
pub use orchestration::{CreateTaskRequest, PipelineOrchestrator, PipelineSystem};
pub use stages::{StageContext, StageError, StageExecutor, StageExecutors, StageOutput};
pub use state_machine::TaskState;
pub use status_sink::{InMemoryStatusSink, StatusSink};
