//! Scheduler services built on the domain ports.

pub mod action_ledger;
pub mod command_tool;
pub mod config_gate;
pub mod dispatcher;
pub mod executor;
pub mod reconciliation;
pub mod retry_policy;
pub mod task_service;
pub mod tool_registry;

pub use action_ledger::ActionLedger;
pub use command_tool::{registry_from_config, CommandTool};
pub use config_gate::{ConfigGate, ConfigSnapshot};
pub use dispatcher::{CycleReport, Dispatcher};
pub use executor::{ExecutionOutcome, Executor};
pub use reconciliation::{ReconciliationSweep, SweepReport};
pub use retry_policy::RetryPolicy;
pub use task_service::{FailureReport, NewTask, TaskService};
pub use tool_registry::{RejectionPolicy, ToolDefinition, ToolRegistry};
