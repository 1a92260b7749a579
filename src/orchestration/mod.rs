//! # Orchestration
//!
//! Admission control, the public task operations and stage chaining, plus the
//! bootstrap that wires them to queue channels and workers.

pub mod admission;
pub mod bootstrap;
pub mod chaining;
pub mod orchestrator;

pub use admission::{AdmissionController, AdmissionDecision};
pub use bootstrap::{PipelineSystem, SystemStatus};
pub use chaining::StageChainer;
pub use orchestrator::{CreateTaskRequest, PipelineOrchestrator};
