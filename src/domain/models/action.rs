//! Action ledger model.
//!
//! An action records one effect-producing tool invocation attempted while
//! executing a task. Actions are append-only audit records: they are never
//! deleted, and terminal actions never change again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::EntityRef;

/// Lifecycle of a ledger entry. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Recorded; the tool has not run yet
    Pending,
    /// The tool ran and its effect happened
    Executed,
    /// The tool failed, or the action was rejected or closed
    Failed,
    /// An executed effect was reverted by an operator
    RolledBack,
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ActionStatus {
    /// Storage and wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Parse a storage name; `None` if unknown.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "executed" => Some(Self::Executed),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }

    /// Whether the action can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Where an approval-gated action currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalState {
    /// The action is not gated
    NotRequired,
    /// Gated, with no decision yet
    AwaitingApproval,
    /// An approver allowed it
    Approved,
    /// An approver refused it
    Rejected,
}

impl ApprovalState {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRequired => "not_required",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

/// A recorded, possibly approval-gated, tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Unique id
    pub id: Uuid,
    /// Task that attempted the effect
    pub task_id: Uuid,
    /// Originating interactive session, if any
    pub session_id: Option<String>,
    /// Originating message, if any
    pub message_id: Option<String>,
    /// Kind of effect, e.g. `tool_call`
    pub action_type: String,
    /// Registry name of the tool
    pub tool_name: String,
    /// Entity the effect applies to
    pub target: Option<EntityRef>,
    /// Current status
    pub status: ActionStatus,
    /// Must be approved before the tool runs
    pub requires_approval: bool,
    /// Set together with `approved_at`
    pub approved_by: Option<String>,
    /// When the approval was recorded
    pub approved_at: Option<DateTime<Utc>>,
    /// Set on rejection; exclusive with approval
    pub rejection_reason: Option<String>,
    /// Input handed to the tool
    pub input: serde_json::Value,
    /// Tool output once executed
    pub output: Option<serde_json::Value>,
    /// Why the action failed
    pub error_message: Option<String>,
    /// When the attempt was recorded
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
    /// When the tool finished successfully
    pub executed_at: Option<DateTime<Utc>>,
}

impl Action {
    /// New pending, ungated action.
    pub fn new(
        task_id: Uuid,
        tool_name: impl Into<String>,
        action_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            session_id: None,
            message_id: None,
            action_type: action_type.into(),
            tool_name: tool_name.into(),
            target: None,
            status: ActionStatus::Pending,
            requires_approval: false,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            input,
            output: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            executed_at: None,
        }
    }

    /// Set the target entity.
    pub fn with_target(mut self, target: Option<EntityRef>) -> Self {
        self.target = target;
        self
    }

    /// Set the approval flag.
    pub fn with_approval_required(mut self, required: bool) -> Self {
        self.requires_approval = required;
        self
    }

    /// Derived from the approval flag and the recorded decision.
    pub fn approval_state(&self) -> ApprovalState {
        if !self.requires_approval {
            ApprovalState::NotRequired
        } else if self.approved_at.is_some() {
            ApprovalState::Approved
        } else if self.rejection_reason.is_some() {
            ApprovalState::Rejected
        } else {
            ApprovalState::AwaitingApproval
        }
    }

    /// Whether the tool may run for this action now.
    pub fn may_execute(&self) -> bool {
        self.status == ActionStatus::Pending
            && matches!(
                self.approval_state(),
                ApprovalState::NotRequired | ApprovalState::Approved
            )
    }
}
