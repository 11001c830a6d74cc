//! Storage port for the action ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Action, ActionStatus, EntityRef};

/// Filters for querying actions
#[derive(Default, Debug, Clone)]
pub struct ActionFilter {
    /// Only actions of this task
    pub task_id: Option<Uuid>,
    /// Only actions in this status
    pub status: Option<ActionStatus>,
    /// Only gated actions with no decision yet
    pub awaiting_approval: bool,
    /// Maximum rows to return
    pub limit: Option<i64>,
}

/// Append-only store for the action ledger.
///
/// Writers never delete rows; updates are guarded by the status the caller
/// expects, so concurrent writers cannot overwrite a terminal record.
#[async_trait]
pub trait ActionRepository: Send + Sync {
    /// Insert a new action.
    async fn create(&self, action: &Action) -> DomainResult<()>;

    /// Fetch an action by id.
    async fn get(&self, id: Uuid) -> DomainResult<Option<Action>>;

    /// Persist `action` only if its stored status is still `expected`.
    /// Returns `false` when the guard did not match.
    async fn update_if_status(&self, action: &Action, expected: ActionStatus) -> DomainResult<bool>;

    /// Persist an approval decision only if the action is still gated,
    /// pending and undecided. Returns `false` when someone decided first.
    async fn record_decision(&self, action: &Action) -> DomainResult<bool>;

    /// Actions matching `filter`, oldest first.
    async fn list(&self, filter: ActionFilter) -> DomainResult<Vec<Action>>;

    /// Most recent action for the same task, tool and target
    async fn latest_for(
        &self,
        task_id: Uuid,
        tool_name: &str,
        target: Option<&EntityRef>,
    ) -> DomainResult<Option<Action>>;

    /// Fail every pending action of a task. Returns how many changed.
    async fn fail_pending_for_task(
        &self,
        task_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<u64>;

    /// Fail pending actions left behind by tasks that already reached a
    /// terminal status. Returns how many changed.
    async fn fail_pending_for_terminal_tasks(&self, reason: &str, now: DateTime<Utc>) -> DomainResult<u64>;
}
