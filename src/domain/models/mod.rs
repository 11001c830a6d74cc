//! Domain models.

pub mod action;
pub mod config;
pub mod task;
pub mod tenant_config;

pub use action::{Action, ActionStatus, ApprovalState};
pub use config::{
    Config, DatabaseConfig, DispatcherConfig, LoggingConfig, ReconciliationConfig, RetryConfig,
    ToolConfig,
};
pub use task::{EntityRef, Task, TaskMetrics, TaskStatus, DEFAULT_PRIORITY};
pub use tenant_config::{AutonomyLevel, QuotaWindow, TenantConfig};
