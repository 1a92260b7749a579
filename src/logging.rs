//! # Structured Logging Module
//!
//! Environment-aware structured logging: a console layer, plus a JSON file layer when
//! `logging.directory` is configured. `RUST_LOG` overrides the level chosen from the
//! environment.

use crate::config::{ConfigManager, LoggingConfig};
use crate::constants::system;
use crate::models::TaskKind;
use chrono::Utc;
use std::fs;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber once; later calls are no-ops
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let level = config
            .level
            .clone()
            .unwrap_or_else(|| get_log_level(&environment).to_string());
        let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

        let console = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(filter());

        let file_layer = config.directory.as_ref().and_then(|dir| {
            if let Err(e) = fs::create_dir_all(dir) {
                eprintln!("conveyor: cannot create log directory {}: {e}", dir.display());
                return None;
            }
            let file_name = format!(
                "{}.{}.{}.log",
                environment,
                process::id(),
                Utc::now().format("%Y%m%d_%H%M%S")
            );
            let (writer, file_guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            // the writer thread must outlive the process-wide subscriber
            std::mem::forget(file_guard);
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(filter()),
            )
        });

        if tracing_subscriber::registry()
            .with(console)
            .with(file_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized, keeping it");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            version = system::CONVEYOR_CORE_VERSION,
            log_directory = ?config.directory,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

/// Log structured data for task operations
pub fn log_task_operation(
    operation: &str,
    task_id: Option<Uuid>,
    kind: Option<TaskKind>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = task_id.map(|id| id.to_string()),
        kind = kind.map(|k| k.as_str()),
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 TASK_OPERATION"
    );
}

/// Log structured data for broker queue operations
pub fn log_queue_operation(
    operation: &str,
    queue: &str,
    message_id: Option<i64>,
    status: &str,
    details: Option<&str>,
) {
    if status == "error" {
        tracing::warn!(
            operation = %operation,
            queue = %queue,
            message_id = message_id,
            status = %status,
            details = details,
            "📨 QUEUE_OPERATION"
        );
    } else {
        tracing::debug!(
            operation = %operation,
            queue = %queue,
            message_id = message_id,
            status = %status,
            details = details,
            "📨 QUEUE_OPERATION"
        );
    }
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "warn");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("staging"), "debug");
    }

    #[test]
    fn test_repeated_init_is_harmless() {
        let config = LoggingConfig::default();
        init_structured_logging(&config);
        init_structured_logging(&config);
        log_task_operation("create", Some(Uuid::new_v4()), Some(TaskKind::Acquire), "pending", None);
        log_error("test", "noop", "nothing failed", None);
    }
}
