//! Task domain model.
//!
//! Tasks are discrete units of background work owned by a tenant. A task's
//! `task_type` is the key of the tool that executes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lowest accepted priority value (most urgent).
pub const MIN_PRIORITY: i32 = 0;
/// Highest accepted priority value (least urgent).
pub const MAX_PRIORITY: i32 = 100;
/// Mid-range priority used when a producer does not specify one.
pub const DEFAULT_PRIORITY: i32 = 50;

/// Status of a task in the execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ready to be claimed (possibly waiting on `next_retry_at`)
    Pending,
    /// Waiting for `scheduled_for` to arrive
    Scheduled,
    /// Claimed by exactly one worker
    Running,
    /// Finished with output
    Completed,
    /// Ended by an unrecoverable failure or a rejection
    Failed,
    /// Stopped at an operator's request
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TaskStatus {
    /// Storage and wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a storage name, accepting `complete` and `canceled` as aliases.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "scheduled" => Some(Self::Scheduled),
            "running" => Some(Self::Running),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States the claim protocol may pick up.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }

    /// Valid transitions from this status.
    ///
    /// `Running -> Pending` covers retry with backoff, orphan recovery by the
    /// reconciliation sweep, and parking on an action awaiting approval.
    /// `Pending -> Failed` happens only when an approver rejects the gated
    /// action a parked task is waiting on.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Failed, Self::Cancelled],
            Self::Scheduled => &[Self::Running, Self::Cancelled],
            Self::Running => &[Self::Completed, Self::Pending, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    /// Whether `new_status` is reachable in one step.
    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Reference to a domain entity owned by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Kind of entity, e.g. `rfi`
    pub entity_type: String,
    /// Id within the owning system
    pub entity_id: String,
}

impl EntityRef {
    /// Reference to `entity_type` `entity_id`.
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Parse `type:id` notation used on the command line.
    pub fn parse(s: &str) -> Option<Self> {
        let (entity_type, entity_id) = s.split_once(':')?;
        if entity_type.is_empty() || entity_id.is_empty() {
            return None;
        }
        Some(Self::new(entity_type, entity_id))
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Advisory execution metrics reported by tools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Model tokens consumed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    /// Spend attributed to the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    /// `completed_at - started_at`, recorded by the handler on every outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<i64>,
}

/// A discrete unit of work executed by a registered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id
    pub id: Uuid,
    /// Owning tenant
    pub tenant_id: String,
    /// Key into the tool registry
    pub task_type: String,
    /// Current status
    pub status: TaskStatus,
    /// Lower is more urgent
    pub priority: i32,
    /// Tool input, as submitted
    pub input: serde_json::Value,
    /// Tool output, set on completion
    pub output: Option<serde_json::Value>,
    /// Entity the task acts on
    pub target: Option<EntityRef>,
    /// Delay work until this time
    pub scheduled_for: Option<DateTime<Utc>>,
    /// When the current or last claim started
    pub started_at: Option<DateTime<Utc>>,
    /// Set on reaching a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Failures retried so far
    pub retry_count: u32,
    /// Retry budget
    pub max_retries: u32,
    /// Set only while pending after a failure
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Usage reported by the tool
    pub metrics: TaskMetrics,
    /// Last recorded failure
    pub error_message: Option<String>,
    /// Structured context for the last failure
    pub error_details: Option<serde_json::Value>,
    /// Identifies the current claim; set only while running
    pub claim_token: Option<Uuid>,
    /// Last sign of life from the claiming worker
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Cancellation requested while running
    pub cancel_requested_at: Option<DateTime<Utc>>,
    /// Version for optimistic locking
    pub version: u64,
    /// When the task was created
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task with default priority and retry budget.
    pub fn new(
        tenant_id: impl Into<String>,
        task_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            priority: DEFAULT_PRIORITY,
            input,
            output: None,
            target: None,
            scheduled_for: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            metrics: TaskMetrics::default(),
            error_message: None,
            error_details: None,
            claim_token: None,
            heartbeat_at: None,
            cancel_requested_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the target entity.
    pub fn with_target(mut self, target: EntityRef) -> Self {
        self.target = Some(target);
        self
    }

    /// Set retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay the task. A future time makes the task `Scheduled`.
    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self.status = if at > self.created_at {
            TaskStatus::Scheduled
        } else {
            TaskStatus::Pending
        };
        self
    }

    /// Shorthand for `self.status.is_terminal()`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a failure may be retried under the budget.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether the claim protocol may pick this task up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable()
            && self.scheduled_for.is_none_or(|at| at <= now)
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Elapsed time between claim and finalization, if both are known.
    pub fn execution_time_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    /// Validate producer-supplied fields.
    pub fn validate(&self) -> Result<(), String> {
        if self.tenant_id.trim().is_empty() {
            return Err("Tenant id cannot be empty".to_string());
        }
        if self.task_type.trim().is_empty() {
            return Err("Task type cannot be empty".to_string());
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(format!(
                "Priority {} out of range {MIN_PRIORITY}..={MAX_PRIORITY}",
                self.priority
            ));
        }
        if self.retry_count > self.max_retries {
            return Err("Retry count cannot exceed max retries".to_string());
        }
        Ok(())
    }
}
