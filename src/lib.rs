//! Foreman - multi-tenant background task scheduler
//!
//! Foreman runs tool-backed tasks for many tenants out of one SQLite
//! database. Producers create tasks; dispatchers claim due work under each
//! tenant's configuration and execute it through registered tools, recording
//! every effect in an append-only action ledger. Approval-gated actions park
//! their task until someone decides, and a reconciliation sweep recovers
//! work whose worker disappeared.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, errors, and the ports adapters implement
//! - **Service Layer** (`services`): task lifecycle, dispatch, execution, reconciliation
//! - **Adapters** (`adapters`): SQLite persistence
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use foreman::adapters::sqlite::*;
//! use foreman::services::{NewTask, TaskService, ToolRegistry};
//!
//! let pool = initialize_database("sqlite:.foreman/foreman.db", None).await?;
//! let tasks = TaskService::new(
//!     Arc::new(SqliteTaskRepository::new(pool.clone())),
//!     Arc::new(SqliteActionRepository::new(pool.clone())),
//!     Arc::new(SqliteTenantConfigRepository::new(pool)),
//!     Arc::new(registry),
//! );
//! let task = tasks.create(NewTask::new("acme", "send_rfi", json!({"document_id": "d-1"}))).await?;
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    Action, ActionStatus, AutonomyLevel, Config, EntityRef, Task, TaskStatus, TenantConfig,
};
pub use domain::ports::{
    ActionRepository, TaskRepository, TenantConfigRepository, ToolContext, ToolError, ToolHandler,
    ToolOutput,
};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{Dispatcher, Executor, ReconciliationSweep, TaskService, ToolDefinition, ToolRegistry};
