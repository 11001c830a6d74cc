//! Port trait definitions (Hexagonal Architecture)
//!
//! Adapters implement these traits:
//! - TaskRepository: task persistence and the claim protocol
//! - ActionRepository: the append-only action ledger
//! - TenantConfigRepository: per-tenant configuration
//! - ToolHandler: the boundary to the tools that execute tasks

pub mod action_repository;
pub mod task_repository;
pub mod tenant_config_repository;
pub mod tool;

pub use action_repository::{ActionFilter, ActionRepository};
pub use task_repository::{ClaimRequest, Heartbeat, TaskFilter, TaskRepository};
pub use tenant_config_repository::TenantConfigRepository;
pub use tool::{ToolContext, ToolError, ToolHandler, ToolOutput};
