//! Application configuration as loaded from `.foreman/config.yaml`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for Foreman
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Retry policy configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Dispatcher loop configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Reconciliation sweep configuration
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,

    /// Command-backed tools available to `foreman serve`
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".foreman/foreman.db".to_string()
}

const fn default_max_connections() -> u32 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    /// `sqlx` connection URL for the configured path.
    pub fn url(&self) -> String {
        format!("sqlite:{}", self.path)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; console only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// File rotation: daily, hourly or never
    #[serde(default = "default_log_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_log_rotation(),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Retry budget given to tasks that do not specify one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on any retry delay, in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    30_000
}

const fn default_max_backoff_ms() -> u64 {
    3_600_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Dispatcher loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DispatcherConfig {
    /// Seconds between dispatch cycles
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Maximum tasks claimed per tenant per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum concurrently executing tasks in this process
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Seconds between executor heartbeats while a task runs
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

const fn default_poll_interval_secs() -> u64 {
    5
}

const fn default_batch_size() -> usize {
    10
}

const fn default_max_workers() -> usize {
    8
}

const fn default_heartbeat_interval_secs() -> u64 {
    30
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl DispatcherConfig {
    /// Seconds between dispatch cycles, as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Seconds between heartbeats, as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Reconciliation sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReconciliationConfig {
    /// A running task with no heartbeat for this long is presumed orphaned
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,

    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

const fn default_stale_threshold_secs() -> u64 {
    900
}

const fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: default_stale_threshold_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl ReconciliationConfig {
    /// Seconds between sweeps, as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// A tool that runs an external command.
///
/// The task input is written to the command's stdin as JSON; stdout is the
/// output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ToolConfig {
    /// Task type served by this tool
    pub name: String,

    /// Tenant feature key that gates task creation
    pub feature: String,

    /// Program and arguments
    pub command: Vec<String>,

    /// Park each invocation until approved
    #[serde(default)]
    pub requires_approval: bool,

    /// Only runs inside tenant working hours
    #[serde(default)]
    pub background: bool,

    /// Failures are retried unless the command says otherwise
    #[serde(default = "default_true")]
    pub retryable_by_default: bool,

    /// Cancel the task instead of failing it when an approver rejects
    #[serde(default)]
    pub cancel_on_rejection: bool,

    /// JSON schema (draft 7) for task input
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,

    /// Seconds before the command is killed
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_true() -> bool {
    true
}

const fn default_tool_timeout_secs() -> u64 {
    300
}

impl ToolConfig {
    /// Timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
