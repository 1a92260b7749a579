//! Data model for orchestrated tasks.

pub mod task;

pub use task::{auto_advance_requested, NewTask, Task, TaskKind, TaskStatusUpdate, TenantId};
