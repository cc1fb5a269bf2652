//! Configuration for the provider.
//!
//! Loaded from YAML with every section defaulted. `load_with_env` also layers
//! `XENCIM_`-prefixed environment variables on top of the file, with `__`
//! separating nested keys (`XENCIM_JOBS__MAX_CONCURRENT=4`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/xencim/provider.yaml";

/// Provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Namespace written into returned object paths and job references
    pub namespace: String,
    /// Pool connection settings
    pub pool: PoolConfig,
    /// Job engine settings
    pub jobs: JobsConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            namespace: "root/cimv2".to_string(),
            pool: PoolConfig::default(),
            jobs: JobsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Pool connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool master URL
    pub url: String,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: "https://localhost".to_string(),
            connect_timeout_secs: 30,
        }
    }
}

/// Job engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Maximum jobs running at once (unset = unbounded). Waiting jobs stay `New`.
    pub max_concurrent: Option<usize>,
    /// Leave the backend task of a finished job for the caller to reap
    pub keep_finished: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            keep_finished: true,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::Pretty
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber for this configuration.
    pub fn init(&self) -> Result<()> {
        match self.format {
            LogFormat::Json => xencim_common::init_logging_json(&self.level),
            LogFormat::Pretty => xencim_common::init_logging(&self.level),
        }
    }
}

impl ProviderConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ProviderConfig = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load configuration from a YAML file with environment overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            )
            .add_source(
                config::Environment::with_prefix("XENCIM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ProviderConfig = config
            .try_deserialize()
            .with_context(|| "Failed to parse config file")?;

        info!(path = %path.display(), "Loaded configuration with environment overrides");
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "namespace".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        if self.jobs.max_concurrent == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "jobs.max_concurrent".to_string(),
                message: "must be greater than 0 when set".to_string(),
            });
        }

        if !xencim_common::is_valid_level(&self.logging.level) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                message: format!("must be one of: {:?}", xencim_common::VALID_LEVELS),
            });
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ProviderConfig::default();
        assert_eq!(config.namespace, "root/cimv2");
        assert_eq!(config.jobs.max_concurrent, None);
        assert!(config.jobs.keep_finished);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ProviderConfig::default();

        // Empty namespace
        config.namespace = " ".to_string();
        assert!(config.validate().is_err());
        config.namespace = "root/cimv2".to_string();

        // Zero concurrency
        config.jobs.max_concurrent = Some(0);
        assert!(config.validate().is_err());
        config.jobs.max_concurrent = Some(1);

        // Invalid log level
        config.logging.level = "chatty".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "debug".to_string();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "namespace: root/xen\njobs:\n  max_concurrent: 2\nlogging:\n  format: json").unwrap();

        let config = ProviderConfig::load(file.path()).unwrap();
        assert_eq!(config.namespace, "root/xen");
        assert_eq!(config.jobs.max_concurrent, Some(2));
        assert!(config.jobs.keep_finished);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.pool, PoolConfig::default());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProviderConfig::load(dir.path().join("absent.yaml")).is_err());
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "jobs: [not, a, map]").unwrap();
        assert!(ProviderConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "namespace: root/xen\npool:\n  url: https://pool-a").unwrap();

        std::env::set_var("XENCIM_POOL__URL", "https://pool-b");
        let config = ProviderConfig::load_with_env(file.path()).unwrap();
        std::env::remove_var("XENCIM_POOL__URL");

        assert_eq!(config.namespace, "root/xen");
        assert_eq!(config.pool.url, "https://pool-b");
    }

    #[test]
    fn test_logging_installs_once() {
        let logging = LoggingConfig::default();
        let _ = logging.init();
        assert!(logging.init().is_err());
    }
}
