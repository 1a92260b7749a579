//! Configuration file loading through `ConfigManager`

use conveyor_core::config::{ConfigManager, ConfigurationError};
use conveyor_core::models::TaskKind;
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

const SAMPLE: &str = r#"
environment = "staging"

[admission]
default_daily_quota = 50
atomic = true

[broker]
enabled = true
shutdown_timeout_seconds = 10

[broker.circuit_breaker]
failure_threshold = 5
timeout_ms = 2000
success_threshold = 1

[queues.transform]
name = "media_transform"
max_attempts = 5
backoff_base_ms = 250
concurrency = 8
"#;

#[test]
fn test_file_values_override_defaults() {
    let file = write_config(SAMPLE);
    let manager = ConfigManager::load_with_overrides(Some(file.path()), HashMap::new()).unwrap();
    let config = manager.config();

    assert_eq!(manager.environment(), "staging");
    assert_eq!(manager.config_path(), Some(file.path()));
    assert_eq!(config.admission.default_daily_quota, Some(50));
    assert!(config.admission.atomic);
    assert_eq!(config.broker.shutdown_timeout(), Duration::from_secs(10));
    assert_eq!(config.broker.circuit_breaker.failure_threshold, 5);
    assert_eq!(config.broker.circuit_breaker.timeout, Duration::from_secs(2));

    let transform = config.queues.for_kind(TaskKind::Transform);
    assert_eq!(transform.name, "media_transform");
    assert_eq!(transform.max_attempts, 5);
    assert_eq!(transform.concurrency, 8);
    let policy = transform.retry_policy();
    assert_eq!(policy.base_delay, Duration::from_millis(250));
    assert_eq!(policy.max_delay, Duration::from_secs(60));

    // untouched sections keep their defaults
    assert_eq!(config.queues.for_kind(TaskKind::Acquire).name, "conveyor_acquire");
    assert_eq!(config.queues.for_kind(TaskKind::Composite).concurrency, 2);
}

#[test]
fn test_environment_overrides_file() {
    let file = write_config(SAMPLE);
    let vars = HashMap::from([
        ("CONVEYOR__QUEUES__TRANSFORM__MAX_ATTEMPTS".to_string(), "7".to_string()),
        ("CONVEYOR__ADMISSION__ATOMIC".to_string(), "false".to_string()),
    ]);
    let manager = ConfigManager::load_with_overrides(Some(file.path()), vars).unwrap();

    assert_eq!(manager.config().queues.transform.max_attempts, 7);
    assert_eq!(manager.config().queues.transform.name, "media_transform");
    assert!(!manager.config().admission.atomic);
}

#[test]
fn test_invalid_values_are_rejected() {
    let file = write_config(
        r#"
[queues.deliver]
backoff_base_ms = 90000
backoff_max_ms = 1000
"#,
    );
    let err = ConfigManager::load_with_overrides(Some(file.path()), HashMap::new()).unwrap_err();
    assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    assert!(err.to_string().contains("queues.deliver.backoff_base_ms"));
}

#[test]
fn test_duplicate_queue_names_are_rejected() {
    let file = write_config(
        r#"
[queues.acquire]
name = "shared"

[queues.deliver]
name = "shared"
"#,
    );
    assert!(ConfigManager::load_with_overrides(Some(file.path()), HashMap::new()).is_err());
}

#[test]
fn test_malformed_file_is_a_load_error() {
    let file = write_config("[admission\natomic = maybe");
    let err = ConfigManager::load_with_overrides(Some(file.path()), HashMap::new()).unwrap_err();
    assert!(matches!(err, ConfigurationError::LoadError { .. }));
}

#[test]
fn test_shipped_sample_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/conveyor.toml");
    let manager = ConfigManager::load_with_overrides(Some(&path), HashMap::new()).unwrap();
    assert!(manager.config().broker.enabled);
}
