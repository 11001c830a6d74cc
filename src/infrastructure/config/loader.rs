//! Layered configuration loading with figment.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::models::Config;

/// Project-local configuration directory
pub const CONFIG_DIR: &str = ".foreman";
/// Prefix for environment overrides; `__` separates nested keys
pub const ENV_PREFIX: &str = "FOREMAN_";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// `logging.level` is not a known level.
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    /// `logging.format` is not a known format.
    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    /// `logging.rotation` is not a known policy.
    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    /// `database.path` is empty.
    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    /// `database.max_connections` is zero.
    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    /// `retry` backoff bounds are zero or inverted; carries initial and max in milliseconds.
    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be positive and not above max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    /// A `dispatcher` count is zero; names the setting.
    #[error("Invalid dispatcher setting {0}: must be at least 1")]
    InvalidDispatcher(&'static str),

    /// The stale threshold does not exceed the heartbeat interval; both in seconds.
    #[error(
        "Invalid reconciliation configuration: stale_threshold_secs ({0}) must exceed the heartbeat interval ({1}s)"
    )]
    StaleThresholdTooShort(u64, u64),

    /// Any other rejected setting.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. .foreman/config.yaml (created by `foreman init`)
    /// 3. .foreman/local.yaml (optional local overrides)
    /// 4. FOREMAN_* environment variables
    pub fn load() -> Result<Config> {
        Self::load_from_dir(CONFIG_DIR)
    }

    /// Same as [`ConfigLoader::load`] with the configuration directory at `dir`.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Config> {
        let dir = dir.as_ref();
        let config: Config = Self::figment()
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, without environment overrides
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Self::figment()
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Path of the primary config file under `dir`.
    pub fn config_path(dir: impl AsRef<Path>) -> PathBuf {
        dir.as_ref().join("config.yaml")
    }

    /// Defaults rendered as YAML, for `foreman init`.
    pub fn default_yaml() -> Result<String> {
        serde_yaml::to_string(&Config::default()).context("Failed to render default configuration")
    }

    fn figment() -> Figment {
        Figment::new().merge(Serialized::defaults(Config::default()))
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.trim().is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        if !["json", "pretty"].contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        if !["daily", "hourly", "never"].contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(config.logging.rotation.clone()));
        }

        let retry = &config.retry;
        if retry.initial_backoff_ms == 0 || retry.initial_backoff_ms > retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(retry.initial_backoff_ms, retry.max_backoff_ms));
        }

        let dispatcher = &config.dispatcher;
        for (name, value) in [
            ("poll_interval_secs", dispatcher.poll_interval_secs as usize),
            ("batch_size", dispatcher.batch_size),
            ("max_workers", dispatcher.max_workers),
            ("heartbeat_interval_secs", dispatcher.heartbeat_interval_secs as usize),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidDispatcher(name));
            }
        }

        let reconciliation = &config.reconciliation;
        if reconciliation.stale_threshold_secs <= dispatcher.heartbeat_interval_secs {
            return Err(ConfigError::StaleThresholdTooShort(
                reconciliation.stale_threshold_secs,
                dispatcher.heartbeat_interval_secs,
            ));
        }
        if reconciliation.sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "reconciliation.sweep_interval_secs must be at least 1".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for tool in &config.tools {
            if tool.name.trim().is_empty() || tool.feature.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "Tool name and feature cannot be empty".to_string(),
                ));
            }
            if tool.command.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "Tool '{}' command cannot be empty",
                    tool.name
                )));
            }
            if !names.insert(tool.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "Tool '{}' is defined twice",
                    tool.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database.path, ".foreman/foreman.db");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.dispatcher.heartbeat_interval_secs, 30);
        assert_eq!(config.reconciliation.stale_threshold_secs, 900);
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
database:
  path: /srv/foreman.db
  max_connections: 5
retry:
  max_retries: 5
dispatcher:
  batch_size: 25
  max_workers: 16
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");
        assert_eq!(config.database.path, "/srv/foreman.db");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_backoff_ms, 30_000);
        assert_eq!(config.dispatcher.batch_size, 25);
        assert_eq!(config.dispatcher.poll_interval_secs, 5);
        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        match ConfigLoader::validate(&config) {
            Err(ConfigError::InvalidLogLevel(level)) => assert_eq!(level, "loud"),
            other => panic!("Expected InvalidLogLevel, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_empty_database_path() {
        let mut config = Config::default();
        config.database.path = String::new();
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::EmptyDatabasePath)));
    }

    #[test]
    fn test_validate_invalid_backoff() {
        let mut config = Config::default();
        config.retry.initial_backoff_ms = 30_000;
        config.retry.max_backoff_ms = 10_000;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(30_000, 10_000))
        ));
    }

    #[test]
    fn test_zero_retries_is_allowed() {
        let mut config = Config::default();
        config.retry.max_retries = 0;
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_validate_zero_workers() {
        let mut config = Config::default();
        config.dispatcher.max_workers = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidDispatcher("max_workers"))
        ));
    }

    #[test]
    fn test_stale_threshold_must_exceed_heartbeat() {
        let mut config = Config::default();
        config.reconciliation.stale_threshold_secs = 30;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::StaleThresholdTooShort(30, 30))
        ));
    }

    #[test]
    fn test_tools_section() {
        let yaml = r#"
tools:
  - name: classify_document
    feature: document_processing
    command: ["python3", "tools/classify.py"]
    input_schema:
      type: object
      required: [document_id]
  - name: send_rfi
    feature: rfi
    command: ["tools/send_rfi.sh"]
    requires_approval: true
    cancel_on_rejection: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tools.len(), 2);
        assert!(config.tools[0].retryable_by_default);
        assert_eq!(config.tools[0].timeout_secs, 300);
        assert!(config.tools[1].requires_approval);
        ConfigLoader::validate(&config).unwrap();

        let mut duplicated = config.clone();
        duplicated.tools.push(config.tools[0].clone());
        assert!(matches!(ConfigLoader::validate(&duplicated), Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn test_hierarchical_merging() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "logging:\n  level: info\n  format: json\ndispatcher:\n  batch_size: 20\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("local.yaml"), "logging:\n  level: debug\n").unwrap();

        temp_env::with_vars_unset(["FOREMAN_LOGGING__LEVEL", "FOREMAN_LOGGING__FORMAT"], || {
            let config = ConfigLoader::load_from_dir(dir.path()).unwrap();
            assert_eq!(config.logging.level, "debug", "local.yaml should win");
            assert_eq!(config.logging.format, "json", "base value should persist");
            assert_eq!(config.dispatcher.batch_size, 20);
        });
    }

    #[test]
    fn test_env_override() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "dispatcher:\n  max_workers: 4\n").unwrap();

        temp_env::with_vars(
            [
                ("FOREMAN_DISPATCHER__MAX_WORKERS", Some("12")),
                ("FOREMAN_LOGGING__LEVEL", Some("warn")),
            ],
            || {
                let config = ConfigLoader::load_from_dir(dir.path()).unwrap();
                assert_eq!(config.dispatcher.max_workers, 12);
                assert_eq!(config.logging.level, "warn");
            },
        );
    }

    #[test]
    fn test_invalid_env_value_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        temp_env::with_var("FOREMAN_LOGGING__FORMAT", Some("xml"), || {
            assert!(ConfigLoader::load_from_dir(dir.path()).is_err());
        });
    }

    #[test]
    fn test_load_from_file_and_default_yaml_round_trip() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", ConfigLoader::default_yaml().unwrap()).unwrap();
        file.flush().unwrap();

        let config = ConfigLoader::load_from_file(file.path()).unwrap();
        assert_eq!(config.dispatcher.max_workers, 8);
    }
}
