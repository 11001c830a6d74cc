//! Logger settings derived from the `logging` section.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::models::LoggingConfig;

/// Resolved logger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is unset (trace, debug, info, warn, error)
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Directory for log files; console only when `None`
    pub log_dir: Option<PathBuf>,

    /// Log to stderr. Stdout is reserved for command output.
    pub enable_console: bool,

    /// File rotation; ignored without `log_dir`
    pub rotation: RotationPolicy,
}

/// Log line format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable
    Pretty,
}

impl LogFormat {
    /// Case-insensitive; `None` for unknown names.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationPolicy {
    /// Roll at midnight
    #[default]
    Daily,
    /// Roll every hour
    Hourly,
    /// One file, never rolled
    Never,
}

impl RotationPolicy {
    /// Case-insensitive; `None` for unknown names.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "daily" => Some(Self::Daily),
            "hourly" => Some(Self::Hourly),
            "never" => Some(Self::Never),
            _ => None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from(&LoggingConfig::default())
    }
}

/// Unrecognised values fall back to defaults; `ConfigLoader::validate`
/// rejects them before this point.
impl From<&LoggingConfig> for LogConfig {
    fn from(settings: &LoggingConfig) -> Self {
        Self {
            level: settings.level.clone(),
            format: LogFormat::parse(&settings.format).unwrap_or(LogFormat::Pretty),
            log_dir: settings.log_dir.as_ref().map(PathBuf::from),
            enable_console: true,
            rotation: RotationPolicy::parse(&settings.rotation).unwrap_or_default(),
        }
    }
}

impl LogConfig {
    /// Quiet console logging for one-shot commands that print results.
    pub fn for_command(settings: &LoggingConfig, verbose: bool) -> Self {
        let mut config = Self::from(settings);
        if !verbose && config.log_dir.is_none() {
            config.level = "warn".to_string();
        }
        config
    }
}
