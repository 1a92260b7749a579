//! Configuration Loader
//!
//! Layers built-in defaults, an optional TOML file and `CONVEYOR__`-prefixed environment
//! variables (double underscore between path segments, e.g.
//! `CONVEYOR__QUEUES__ACQUIRE__MAX_ATTEMPTS=5`), then validates the result.

use super::error::{ConfigResult, ConfigurationError};
use super::PipelineConfig;
use crate::constants::system;
use config::{Config, Environment, File, FileFormat};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const ENV_PREFIX: &str = "CONVEYOR";
const ENV_SEPARATOR: &str = "__";

pub struct ConfigManager {
    config: PipelineConfig,
    environment: String,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Defaults plus process environment, no file
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::build(None, None)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
        Self::build(Some(path.as_ref()), None)
    }

    /// Like [`load_from_file`](Self::load_from_file), but reads overrides from `vars`
    /// instead of the process environment
    pub fn load_with_overrides(
        path: Option<&Path>,
        vars: HashMap<String, String>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::build(path, Some(vars))
    }

    /// Wrap an already-built configuration after validating it
    pub fn from_config(config: PipelineConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            environment: config.environment.clone(),
            config,
            config_path: None,
        }))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// `CONVEYOR_ENV`, then `APP_ENV`, defaulting to `development`
    pub fn detect_environment() -> String {
        env::var(system::ENVIRONMENT_VAR)
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| system::DEFAULT_ENVIRONMENT.to_string())
            .to_lowercase()
    }

    fn build(
        path: Option<&Path>,
        vars: Option<HashMap<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let defaults = Config::try_from(&PipelineConfig::default())
            .map_err(|e| ConfigurationError::load_error("defaults", e))?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigurationError::config_file_not_found(path));
            }
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        let environment_source = Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true);
        let from_process_env = vars.is_none();
        builder = builder.add_source(match vars {
            Some(vars) => environment_source.source(Some(vars)),
            None => environment_source,
        });

        let source_name = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "environment".to_string());
        let mut config: PipelineConfig = builder
            .build()
            .and_then(|merged| merged.try_deserialize())
            .map_err(|e| ConfigurationError::load_error(&source_name, e))?;

        if from_process_env {
            if let Ok(environment) = env::var(system::ENVIRONMENT_VAR) {
                config.environment = environment.to_lowercase();
            }
        }

        config.validate()?;

        info!(
            environment = %config.environment,
            source = %source_name,
            broker_enabled = config.broker.enabled,
            atomic_admission = config.admission.atomic,
            "⚙️ Configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            environment: config.environment.clone(),
            config,
            config_path: path.map(Path::to_path_buf),
        }))
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("environment", &self.environment)
            .field("config_path", &self.config_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;

    #[test]
    fn test_overrides_without_file() {
        let vars = HashMap::from([
            (
                "CONVEYOR__ADMISSION__DEFAULT_DAILY_QUOTA".to_string(),
                "25".to_string(),
            ),
            ("CONVEYOR__BROKER__ENABLED".to_string(), "false".to_string()),
        ]);
        let manager = ConfigManager::load_with_overrides(None, vars).unwrap();

        assert_eq!(manager.config().admission.default_daily_quota, Some(25));
        assert!(!manager.config().broker.enabled);
        assert_eq!(manager.config().queues.acquire, QueueConfig::named("conveyor_acquire"));
        assert!(manager.config_path().is_none());
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigManager::load_with_overrides(
            Some(Path::new("/definitely/not/here.toml")),
            HashMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::ConfigFileNotFound { .. }));
    }

    #[test]
    fn test_from_config_validates() {
        let mut config = PipelineConfig::default();
        config.queues.deliver.max_attempts = 0;
        assert!(ConfigManager::from_config(config).is_err());
        assert!(ConfigManager::from_config(PipelineConfig::default()).is_ok());
    }
}
