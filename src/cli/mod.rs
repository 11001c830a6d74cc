//! Command-line interface.

pub mod commands;
pub mod context;
pub mod output;

use clap::{Parser, Subcommand};
use serde_json::json;

use crate::domain::errors::DomainError;
use commands::{
    action::ActionArgs, init::InitArgs, serve::ServeArgs, sweep::SweepArgs, task::TaskArgs, tenant::TenantArgs,
};

/// Top-level command line.
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(about = "Foreman - multi-tenant background task scheduler", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Log at the configured level instead of warnings only
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize configuration and database
    Init(InitArgs),
    /// Tenant configuration
    Tenant(TenantArgs),
    /// Task management
    Task(TaskArgs),
    /// Action ledger and approvals
    Action(ActionArgs),
    /// Run one reconciliation pass
    Sweep(SweepArgs),
    /// Run the dispatcher and reconciliation sweep until interrupted
    Serve(ServeArgs),
}

impl Commands {
    /// Long-running commands log at the configured level.
    pub fn is_long_running(&self) -> bool {
        matches!(self, Self::Serve(args) if !args.once)
    }
}

/// Stable machine-readable name for a failure.
pub fn error_kind(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<DomainError>() {
        Some(DomainError::Validation(_)) => "validation",
        Some(DomainError::Transient(_)) => "transient",
        Some(DomainError::ApprovalRejected { .. }) => "approval_rejected",
        Some(DomainError::QuotaExceeded { .. }) => "quota_exceeded",
        Some(DomainError::StaleClaim { .. }) => "stale_claim",
        Some(DomainError::InvalidState { .. }) => "invalid_state",
        Some(DomainError::ConcurrencyConflict { .. }) => "conflict",
        Some(DomainError::TaskNotFound(_) | DomainError::ActionNotFound(_) | DomainError::TenantNotFound(_)) => {
            "not_found"
        }
        Some(DomainError::DatabaseError(_) | DomainError::SerializationError(_)) => "storage",
        None => "error",
    }
}

/// Report `err` and exit with status 1.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let body = json!({
            "success": false,
            "error": format!("{err:#}"),
            "kind": error_kind(&err),
        });
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1);
}
