//! Action ledger CLI commands: review and decide gated actions.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde_json::Value;
use uuid::Uuid;

use crate::cli::context::AppContext;
use crate::cli::output::{format_time, list_table, output, short_id, CommandOutput};
use crate::domain::models::{Action, ActionStatus, Config};
use crate::domain::ports::ActionFilter;

/// Arguments for `foreman action`.
#[derive(Args, Debug)]
pub struct ActionArgs {
    /// Action subcommand to run.
    #[command(subcommand)]
    pub command: ActionCommands,
}

/// Subcommands of `foreman action`.
#[derive(Subcommand, Debug)]
pub enum ActionCommands {
    /// List recorded actions
    List {
        /// Only actions of this task
        #[arg(short, long)]
        task: Option<Uuid>,
        /// Filter by status (pending, executed, failed, rolled_back)
        #[arg(short, long)]
        status: Option<String>,
        /// Only gated actions waiting for a decision
        #[arg(long)]
        awaiting: bool,
        /// Maximum number of actions to display
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
    /// Show one action
    Show {
        /// Action ID
        id: Uuid,
    },
    /// Approve a gated action; its task runs on the next dispatch cycle
    Approve {
        /// Action ID
        id: Uuid,
        /// Who approved it
        #[arg(long, env = "USER")]
        approver: String,
    },
    /// Reject a gated action
    Reject {
        /// Action ID
        id: Uuid,
        /// Why it was rejected
        #[arg(short, long)]
        reason: String,
    },
    /// Record that an executed action was undone
    Rollback {
        /// Action ID
        id: Uuid,
    },
}

/// One action as printed by the CLI.
#[derive(Debug, serde::Serialize)]
pub struct ActionOutput {
    /// Action id
    pub id: String,
    /// Owning task id
    pub task_id: String,
    /// Tool that was invoked
    pub tool_name: String,
    /// Kind of effect
    pub action_type: String,
    /// Target entity as `type:id`
    pub target: Option<String>,
    /// Ledger status
    pub status: String,
    /// Approval state name
    pub approval: String,
    /// Approver, once approved
    pub approved_by: Option<String>,
    /// Reason, once rejected
    pub rejection_reason: Option<String>,
    /// Tool input
    pub input: Value,
    /// Tool output, once executed
    pub output: Option<Value>,
    /// Failure message
    pub error_message: Option<String>,
    /// When the attempt was recorded
    pub created_at: DateTime<Utc>,
    /// When the tool finished
    pub executed_at: Option<DateTime<Utc>>,
}

impl From<&Action> for ActionOutput {
    fn from(action: &Action) -> Self {
        Self {
            id: action.id.to_string(),
            task_id: action.task_id.to_string(),
            tool_name: action.tool_name.clone(),
            action_type: action.action_type.clone(),
            target: action.target.as_ref().map(ToString::to_string),
            status: action.status.as_str().to_string(),
            approval: action.approval_state().as_str().to_string(),
            approved_by: action.approved_by.clone(),
            rejection_reason: action.rejection_reason.clone(),
            input: action.input.clone(),
            output: action.output.clone(),
            error_message: action.error_message.clone(),
            created_at: action.created_at,
            executed_at: action.executed_at,
        }
    }
}

impl CommandOutput for ActionOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![
            format!("Action: {}", self.id),
            format!("Task: {}", self.task_id),
            format!("Tool: {} ({})", self.tool_name, self.action_type),
            format!("Status: {}", self.status),
            format!("Approval: {}", self.approval),
            format!("Created: {}", format_time(Some(self.created_at))),
        ];
        if let Some(target) = &self.target {
            lines.push(format!("Target: {target}"));
        }
        if let Some(approver) = &self.approved_by {
            lines.push(format!("Approved by: {approver}"));
        }
        if let Some(reason) = &self.rejection_reason {
            lines.push(format!("Rejected: {reason}"));
        }
        if self.executed_at.is_some() {
            lines.push(format!("Executed: {}", format_time(self.executed_at)));
        }
        if let Some(error) = &self.error_message {
            lines.push(format!("Error: {error}"));
        }
        lines.push(format!("Input: {}", self.input));
        if let Some(out) = &self.output {
            lines.push(format!("Output: {out}"));
        }
        lines.join("\n")
    }
}

/// Result of `foreman action list`.
#[derive(Debug, serde::Serialize)]
pub struct ActionListOutput {
    /// Matching actions, oldest first
    pub actions: Vec<ActionOutput>,
    /// Number of actions returned
    pub total: usize,
}

impl CommandOutput for ActionListOutput {
    fn to_human(&self) -> String {
        if self.actions.is_empty() {
            return "No actions found.".to_string();
        }

        let mut table = list_table(&["ID", "TASK", "TOOL", "TARGET", "STATUS", "APPROVAL", "CREATED"]);
        for action in &self.actions {
            table.add_row(vec![
                short_id(&action.id).to_string(),
                short_id(&action.task_id).to_string(),
                action.tool_name.clone(),
                action.target.clone().unwrap_or_else(|| "-".to_string()),
                action.status.clone(),
                action.approval.clone(),
                format_time(Some(action.created_at)),
            ]);
        }
        format!("Found {} action(s):\n\n{table}", self.total)
    }
}

/// Result of an approve, reject or rollback.
#[derive(Debug, serde::Serialize)]
pub struct ActionDecisionOutput {
    /// Always `true`; failures take the error path
    pub success: bool,
    /// Human-readable summary
    pub message: String,
    /// The action after the decision
    pub action: ActionOutput,
    /// Task status after a rejection resolved it
    pub task_status: Option<String>,
}

impl CommandOutput for ActionDecisionOutput {
    fn to_human(&self) -> String {
        self.message.clone()
    }
}

/// Run an action subcommand.
pub async fn execute(args: ActionArgs, config: Config, json_mode: bool) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let service = ctx.tasks.clone();

    match args.command {
        ActionCommands::List {
            task,
            status,
            awaiting,
            limit,
        } => {
            let status = status
                .map(|s| ActionStatus::from_str(&s).ok_or_else(|| anyhow!("Invalid status: {s}")))
                .transpose()?;
            let actions = service
                .ledger()
                .list(ActionFilter {
                    task_id: task,
                    status,
                    awaiting_approval: awaiting,
                    limit: Some(limit),
                })
                .await?;
            let actions: Vec<ActionOutput> = actions.iter().map(ActionOutput::from).collect();
            output(
                &ActionListOutput {
                    total: actions.len(),
                    actions,
                },
                json_mode,
            );
        }
        ActionCommands::Show { id } => {
            let action = service.ledger().get(id).await?;
            output(&ActionOutput::from(&action), json_mode);
        }
        ActionCommands::Approve { id, approver } => {
            let action = service.approve_action(id, &approver).await?;
            output(
                &ActionDecisionOutput {
                    success: true,
                    message: format!("Action {id} approved by {approver}; task {} will resume.", action.task_id),
                    action: ActionOutput::from(&action),
                    task_status: None,
                },
                json_mode,
            );
        }
        ActionCommands::Reject { id, reason } => {
            let (action, task) = service.reject_action(id, &reason).await?;
            output(
                &ActionDecisionOutput {
                    success: true,
                    message: format!("Action {id} rejected; task {} is {}.", task.id, task.status),
                    action: ActionOutput::from(&action),
                    task_status: Some(task.status.as_str().to_string()),
                },
                json_mode,
            );
        }
        ActionCommands::Rollback { id } => {
            let action = service.ledger().mark_rolled_back(id).await?;
            output(
                &ActionDecisionOutput {
                    success: true,
                    message: format!("Action {id} marked as rolled back."),
                    action: ActionOutput::from(&action),
                    task_status: None,
                },
                json_mode,
            );
        }
    }

    ctx.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_output_reports_approval_state() {
        let action = Action::new(Uuid::new_v4(), "send_rfi", "tool_call", json!({})).with_approval_required(true);
        let out = ActionOutput::from(&action);
        assert_eq!(out.status, "pending");
        assert_eq!(out.approval, "awaiting_approval");
        assert!(out.to_human().contains("Approval: awaiting_approval"));
    }

    #[test]
    fn test_empty_list() {
        let list = ActionListOutput {
            actions: vec![],
            total: 0,
        };
        assert_eq!(list.to_human(), "No actions found.");
        assert_eq!(list.to_json()["total"], json!(0));
    }
}
