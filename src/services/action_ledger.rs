//! Action ledger service and approval gate.
//!
//! Every tool invocation is recorded before it runs. Gated actions stay
//! `pending` until an approver decides; no code path can mark a gated action
//! executed without an approval timestamp.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Action, ActionStatus, ApprovalState, Task};
use crate::domain::ports::{ActionFilter, ActionRepository};

/// Reason recorded on actions closed because their task was cancelled.
pub const TASK_CANCELLED: &str = "task cancelled";
/// Reason recorded on sibling actions when a rejection failed their task.
pub const TASK_REJECTED: &str = "task failed after a rejected action";
/// Reason recorded on actions found pending after their task finished.
pub const TASK_FINISHED: &str = "task finished before action resolved";

/// Records and guards every effect a task attempts.
pub struct ActionLedger<A: ActionRepository> {
    repo: Arc<A>,
}

impl<A: ActionRepository> ActionLedger<A> {
    /// Ledger over `repo`.
    pub fn new(repo: Arc<A>) -> Self {
        Self { repo }
    }

    /// Fetch an action, failing with `ActionNotFound`.
    pub async fn get(&self, id: Uuid) -> DomainResult<Action> {
        self.repo.get(id).await?.ok_or(DomainError::ActionNotFound(id))
    }

    /// Actions matching `filter`, oldest first.
    pub async fn list(&self, filter: ActionFilter) -> DomainResult<Vec<Action>> {
        self.repo.list(filter).await
    }

    /// Record an attempt to invoke `tool_name` for `task`.
    pub async fn record_attempt(
        &self,
        task: &Task,
        tool_name: &str,
        requires_approval: bool,
    ) -> DomainResult<Action> {
        let action = Action::new(task.id, tool_name, "tool_call", task.input.clone())
            .with_target(task.target.clone())
            .with_approval_required(requires_approval);
        self.repo.create(&action).await?;

        info!(
            action_id = %action.id,
            task_id = %task.id,
            tool = tool_name,
            requires_approval,
            "Recorded action attempt"
        );
        Ok(action)
    }

    /// Latest attempt for the same task, tool and target.
    pub async fn latest_attempt(&self, task: &Task, tool_name: &str) -> DomainResult<Option<Action>> {
        self.repo.latest_for(task.id, tool_name, task.target.as_ref()).await
    }

    /// Record an approval. Fails unless the action is gated, pending and undecided.
    pub async fn approve(&self, action_id: Uuid, approver: &str) -> DomainResult<Action> {
        if approver.trim().is_empty() {
            return Err(DomainError::Validation("Approver id cannot be empty".to_string()));
        }
        let mut action = self.get(action_id).await?;
        Self::ensure_awaiting(&action)?;

        let now = Utc::now();
        action.approved_by = Some(approver.to_string());
        action.approved_at = Some(now);
        action.updated_at = now;
        self.decide(&action).await?;

        info!(action_id = %action.id, task_id = %action.task_id, approver, "Action approved");
        Ok(action)
    }

    /// Reject a gated action. The action fails with the reason; resolving
    /// the owning task is the caller's job.
    pub async fn reject(&self, action_id: Uuid, reason: &str) -> DomainResult<Action> {
        if reason.trim().is_empty() {
            return Err(DomainError::Validation("Rejection reason cannot be empty".to_string()));
        }
        let mut action = self.get(action_id).await?;
        Self::ensure_awaiting(&action)?;

        let now = Utc::now();
        action.status = ActionStatus::Failed;
        action.rejection_reason = Some(reason.to_string());
        action.error_message = Some(format!("rejected: {reason}"));
        action.updated_at = now;
        self.decide(&action).await?;

        info!(action_id = %action.id, task_id = %action.task_id, reason, "Action rejected");
        Ok(action)
    }

    /// Mark a pending action executed with its output.
    ///
    /// Refused for a gated action with no approval on record.
    pub async fn mark_executed(&self, action: &Action, output: serde_json::Value) -> DomainResult<Action> {
        if !action.may_execute() {
            return Err(DomainError::InvalidState {
                entity: "action",
                id: action.id,
                reason: "action is not cleared to execute".to_string(),
            });
        }

        let now = Utc::now();
        let mut updated = action.clone();
        updated.status = ActionStatus::Executed;
        updated.output = Some(output);
        updated.executed_at = Some(now);
        updated.updated_at = now;
        self.write(&updated, ActionStatus::Pending).await?;
        Ok(updated)
    }

    /// Mark a pending action failed.
    pub async fn mark_failed(&self, action: &Action, message: &str) -> DomainResult<Action> {
        let now = Utc::now();
        let mut updated = action.clone();
        updated.status = ActionStatus::Failed;
        updated.error_message = Some(message.to_string());
        updated.updated_at = now;
        self.write(&updated, ActionStatus::Pending).await?;
        Ok(updated)
    }

    /// Record that a compensating step undid an executed action.
    pub async fn mark_rolled_back(&self, action_id: Uuid) -> DomainResult<Action> {
        let mut action = self.get(action_id).await?;
        if action.status != ActionStatus::Executed {
            return Err(DomainError::InvalidState {
                entity: "action",
                id: action_id,
                reason: format!("only executed actions can be rolled back, status is {}", action.status),
            });
        }

        action.status = ActionStatus::RolledBack;
        action.updated_at = Utc::now();
        self.write(&action, ActionStatus::Executed).await?;

        warn!(action_id = %action.id, task_id = %action.task_id, "Action rolled back");
        Ok(action)
    }

    /// Close every pending action of a task with `reason`.
    pub async fn close_pending(&self, task_id: Uuid, reason: &str) -> DomainResult<u64> {
        self.repo.fail_pending_for_task(task_id, reason, Utc::now()).await
    }

    /// Close pending actions whose tasks already finished.
    pub async fn close_orphaned(&self) -> DomainResult<u64> {
        self.repo.fail_pending_for_terminal_tasks(TASK_FINISHED, Utc::now()).await
    }

    fn ensure_awaiting(action: &Action) -> DomainResult<()> {
        if action.status == ActionStatus::Pending
            && action.approval_state() == ApprovalState::AwaitingApproval
        {
            return Ok(());
        }
        let reason = match action.approval_state() {
            ApprovalState::NotRequired => "action does not require approval".to_string(),
            ApprovalState::Approved => "action was already approved".to_string(),
            ApprovalState::Rejected => "action was already rejected".to_string(),
            ApprovalState::AwaitingApproval => format!("action is {}", action.status),
        };
        Err(DomainError::InvalidState {
            entity: "action",
            id: action.id,
            reason,
        })
    }

    async fn decide(&self, action: &Action) -> DomainResult<()> {
        if self.repo.record_decision(action).await? {
            Ok(())
        } else {
            Err(DomainError::InvalidState {
                entity: "action",
                id: action.id,
                reason: "action was decided concurrently".to_string(),
            })
        }
    }

    async fn write(&self, action: &Action, expected: ActionStatus) -> DomainResult<()> {
        if self.repo.update_if_status(action, expected).await? {
            Ok(())
        } else {
            Err(DomainError::InvalidState {
                entity: "action",
                id: action.id,
                reason: format!("action is no longer {expected}"),
            })
        }
    }
}
