//! # System Constants
//!
//! Names shared between configuration, logging and the broker queues.

/// Operation names recorded by [`crate::logging::log_task_operation`]
pub mod operations {
    pub const CREATE_TASK: &str = "create_task";
    pub const CANCEL_TASK: &str = "cancel_task";
    pub const DELETE_TASK: &str = "delete_task";
    pub const REDISPATCH_TASK: &str = "redispatch_task";
    pub const CHAIN_TASK: &str = "chain_task";
    pub const HANDLE_JOB: &str = "handle_job";
}

pub mod system {
    pub const CONVEYOR_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

    /// Environment variable naming the deployment environment
    pub const ENVIRONMENT_VAR: &str = "CONVEYOR_ENV";
    pub const DEFAULT_ENVIRONMENT: &str = "development";

    /// Prefix of every broker queue created with default configuration
    pub const QUEUE_PREFIX: &str = "conveyor_";
}

/// Default queue name for a stage, e.g. `conveyor_acquire`
pub fn default_queue_name(kind: crate::models::TaskKind) -> String {
    format!("{}{}", system::QUEUE_PREFIX, kind.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskKind;

    #[test]
    fn test_default_queue_names() {
        assert_eq!(default_queue_name(TaskKind::Acquire), "conveyor_acquire");
        assert_eq!(default_queue_name(TaskKind::Composite), "conveyor_composite");
    }
}
