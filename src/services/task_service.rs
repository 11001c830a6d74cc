//! Task lifecycle service: creation, the completion/failure handler,
//! cancellation, and the approval API.
//!
//! Every state change goes through [`TaskService::mutate`], which re-reads
//! the row, applies the change in memory, checks the state machine, and
//! writes it back under the row's version. A concurrent writer forces a
//! re-read rather than a lost update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Action, EntityRef, Task, TaskMetrics, TaskStatus};
use crate::domain::ports::{
    ActionRepository, Heartbeat, TaskFilter, TaskRepository, TenantConfigRepository,
};
use crate::services::action_ledger::{ActionLedger, TASK_CANCELLED, TASK_FINISHED, TASK_REJECTED};
use crate::services::config_gate::ConfigGate;
use crate::services::retry_policy::RetryPolicy;
use crate::services::tool_registry::{RejectionPolicy, ToolRegistry};

/// Attempts before a contended write gives up.
const MAX_CONFLICT_RETRIES: usize = 5;

/// Producer-supplied fields of a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    /// Owning tenant
    pub tenant_id: String,
    /// Registry key of the tool to run
    pub task_type: String,
    /// Tool input
    pub input: serde_json::Value,
    /// Entity the task acts on
    pub target: Option<EntityRef>,
    /// A future time creates the task as `scheduled`
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Defaults to the mid-range priority
    pub priority: Option<i32>,
    /// Defaults to the configured retry budget
    pub max_retries: Option<u32>,
}

impl NewTask {
    /// Request with default priority, retries and schedule.
    pub fn new(tenant_id: impl Into<String>, task_type: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            task_type: task_type.into(),
            input,
            target: None,
            scheduled_for: None,
            priority: None,
            max_retries: None,
        }
    }

    /// Set the priority; lower runs first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the target entity.
    pub fn with_target(mut self, target: EntityRef) -> Self {
        self.target = Some(target);
        self
    }

    /// Delay the task until `at`.
    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A failure reported by a worker or an administrator.
#[derive(Debug, Clone)]
pub struct FailureReport {
    /// Recorded as the task's error message
    pub message: String,
    /// Recorded as the task's error details
    pub details: Option<serde_json::Value>,
    /// Whether the failure may clear on retry
    pub retryable: bool,
}

impl FailureReport {
    /// A failure that may clear on retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            retryable: true,
        }
    }

    /// A failure that ends the task.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            retryable: false,
        }
    }

    /// Attach structured context.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

enum Mutation {
    Write,
    Unchanged,
}

/// Owns every task state transition.
///
/// Every write is a compare-and-swap on the task's version, and writes that
/// require a claim check the caller's claim token first.
pub struct TaskService<T: TaskRepository, A: ActionRepository, C: TenantConfigRepository> {
    task_repo: Arc<T>,
    ledger: Arc<ActionLedger<A>>,
    gate: ConfigGate<T, C>,
    registry: Arc<ToolRegistry>,
    retry_policy: RetryPolicy,
}

impl<T: TaskRepository, A: ActionRepository, C: TenantConfigRepository> TaskService<T, A, C> {
    /// Service over the given stores, with the default retry policy.
    pub fn new(
        task_repo: Arc<T>,
        action_repo: Arc<A>,
        config_repo: Arc<C>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            gate: ConfigGate::new(task_repo.clone(), config_repo, registry.clone()),
            ledger: Arc::new(ActionLedger::new(action_repo)),
            task_repo,
            registry,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// The action ledger.
    pub fn ledger(&self) -> &Arc<ActionLedger<A>> {
        &self.ledger
    }

    /// The creation-time gate.
    pub fn gate(&self) -> &ConfigGate<T, C> {
        &self.gate
    }

    /// The tool registry.
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// The policy used for retry budgets and backoff.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Create a task after the configuration gate admits it.
    pub async fn create(&self, request: NewTask) -> DomainResult<Task> {
        let mut task = Task::new(request.tenant_id, request.task_type, request.input)
            .with_max_retries(request.max_retries.unwrap_or(self.retry_policy.max_retries));
        if let Some(priority) = request.priority {
            task = task.with_priority(priority);
        }
        if let Some(target) = request.target {
            task = task.with_target(target);
        }
        if let Some(at) = request.scheduled_for {
            task = task.with_scheduled_for(at);
        }

        task.validate().map_err(DomainError::Validation)?;
        self.gate.admit(&task, task.created_at).await?;
        self.task_repo.create(&task).await?;

        info!(
            task_id = %task.id,
            tenant_id = %task.tenant_id,
            task_type = %task.task_type,
            status = %task.status,
            priority = task.priority,
            "Task created"
        );
        Ok(task)
    }

    /// Fetch a task, failing with `TaskNotFound`.
    pub async fn get(&self, id: Uuid) -> DomainResult<Task> {
        self.task_repo.get(id).await?.ok_or(DomainError::TaskNotFound(id))
    }

    /// Tasks matching `filter`.
    pub async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        self.task_repo.list(filter).await
    }

    /// Task counts per status, for one tenant or all.
    pub async fn count_by_status(&self, tenant_id: Option<&str>) -> DomainResult<HashMap<TaskStatus, u64>> {
        self.task_repo.count_by_status(tenant_id).await
    }

    /// Success path. Completing an already-completed task returns it unchanged.
    ///
    /// `claim_token` is required from workers; administrative reports may
    /// omit it.
    pub async fn complete(
        &self,
        id: Uuid,
        claim_token: Option<Uuid>,
        output: serde_json::Value,
        metrics: TaskMetrics,
    ) -> DomainResult<Task> {
        let task = self
            .mutate(id, |task, now| {
                if task.status == TaskStatus::Completed {
                    return Ok(Mutation::Unchanged);
                }
                Self::ensure_running(task, claim_token)?;

                task.status = TaskStatus::Completed;
                task.output = Some(output.clone());
                task.completed_at = Some(now);
                task.metrics = TaskMetrics {
                    execution_time_ms: None,
                    ..metrics.clone()
                };
                task.metrics.execution_time_ms = task.execution_time_ms();
                task.next_retry_at = None;
                task.error_message = None;
                task.error_details = None;
                Self::release_claim(task);
                Ok(Mutation::Write)
            })
            .await?;

        info!(task_id = %task.id, execution_time_ms = ?task.metrics.execution_time_ms, "Task completed");
        Ok(task)
    }

    /// Failure path: requeue with backoff while retries remain and the
    /// failure is retryable, otherwise fail terminally.
    pub async fn fail(&self, id: Uuid, claim_token: Option<Uuid>, report: FailureReport) -> DomainResult<Task> {
        let policy = &self.retry_policy;
        let task = self
            .mutate(id, |task, now| {
                if task.status == TaskStatus::Failed {
                    return Ok(Mutation::Unchanged);
                }
                Self::ensure_running(task, claim_token)?;

                task.error_message = Some(report.message.clone());
                task.error_details = report.details.clone();
                task.metrics.execution_time_ms =
                    task.started_at.map(|start| (now - start).num_milliseconds());

                if report.retryable && task.can_retry() {
                    task.retry_count += 1;
                    task.next_retry_at = Some(policy.next_retry_at(now, task.retry_count));
                    task.status = TaskStatus::Pending;
                    task.started_at = None;
                } else {
                    task.status = TaskStatus::Failed;
                    task.completed_at = Some(now);
                    task.next_retry_at = None;
                }
                Self::release_claim(task);
                Ok(Mutation::Write)
            })
            .await?;

        match task.status {
            TaskStatus::Pending => info!(
                task_id = %task.id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                next_retry_at = ?task.next_retry_at,
                error = %report.message,
                "Task failed, retry scheduled"
            ),
            _ => warn!(
                task_id = %task.id,
                retry_count = task.retry_count,
                retryable = report.retryable,
                error = %report.message,
                "Task failed permanently"
            ),
        }
        Ok(task)
    }

    /// Request cancellation.
    ///
    /// Waiting tasks are cancelled immediately. Running tasks get a recorded
    /// request that the executor observes at its next checkpoint.
    pub async fn cancel(&self, id: Uuid) -> DomainResult<Task> {
        let task = self
            .mutate(id, |task, now| match task.status {
                TaskStatus::Cancelled => Ok(Mutation::Unchanged),
                TaskStatus::Running if task.cancel_requested_at.is_some() => Ok(Mutation::Unchanged),
                TaskStatus::Running => {
                    task.cancel_requested_at = Some(now);
                    Ok(Mutation::Write)
                }
                TaskStatus::Pending | TaskStatus::Scheduled => {
                    task.status = TaskStatus::Cancelled;
                    task.cancel_requested_at = Some(now);
                    task.completed_at = Some(now);
                    task.next_retry_at = None;
                    Ok(Mutation::Write)
                }
                TaskStatus::Completed | TaskStatus::Failed => Err(DomainError::InvalidState {
                    entity: "task",
                    id: task.id,
                    reason: format!("cannot cancel a {} task", task.status),
                }),
            })
            .await?;

        if task.status == TaskStatus::Cancelled {
            let closed = self.ledger.close_pending(task.id, TASK_CANCELLED).await?;
            info!(task_id = %task.id, closed_actions = closed, "Task cancelled");
        } else {
            info!(task_id = %task.id, "Cancellation requested for running task");
        }
        Ok(task)
    }

    /// Finish a running task whose worker stopped after a cancellation request.
    pub async fn finalize_cancelled(&self, id: Uuid, claim_token: Option<Uuid>) -> DomainResult<Task> {
        let task = self
            .mutate(id, |task, now| {
                if task.status == TaskStatus::Cancelled {
                    return Ok(Mutation::Unchanged);
                }
                Self::ensure_running(task, claim_token)?;

                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(now);
                task.cancel_requested_at.get_or_insert(now);
                task.metrics.execution_time_ms = task.execution_time_ms();
                Self::release_claim(task);
                Ok(Mutation::Write)
            })
            .await?;

        let closed = self.ledger.close_pending(task.id, TASK_CANCELLED).await?;
        info!(task_id = %task.id, closed_actions = closed, "Running task cancelled");
        Ok(task)
    }

    /// Return a running task to `pending` while one of its actions awaits
    /// approval. The claim query holds it back until the approval lands.
    pub async fn park(&self, id: Uuid, claim_token: Uuid) -> DomainResult<Task> {
        let task = self
            .mutate(id, |task, _now| {
                Self::ensure_running(task, Some(claim_token))?;
                task.status = TaskStatus::Pending;
                task.started_at = None;
                Self::release_claim(task);
                Ok(Mutation::Write)
            })
            .await?;

        info!(task_id = %task.id, "Task parked awaiting approval");
        Ok(task)
    }

    /// Liveness checkpoint for a claimed task.
    pub async fn heartbeat(&self, id: Uuid, claim_token: Uuid) -> DomainResult<Heartbeat> {
        self.task_repo.heartbeat(id, claim_token, Utc::now()).await
    }

    /// Requeue a task the sweep found stale. Returns `None` if the row moved
    /// since it was read, meaning its worker is alive after all.
    pub async fn recover_orphan(&self, stale: &Task) -> DomainResult<Option<Task>> {
        if stale.status != TaskStatus::Running {
            return Ok(None);
        }

        let now = Utc::now();
        let mut task = stale.clone();
        if task.cancel_requested_at.is_some() {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(now);
            task.metrics.execution_time_ms = task.execution_time_ms();
        } else {
            task.status = TaskStatus::Pending;
            task.started_at = None;
        }
        Self::release_claim(&mut task);
        task.updated_at = now;

        match self.task_repo.update(&task).await {
            Ok(version) => task.version = version,
            Err(DomainError::ConcurrencyConflict { .. }) => {
                debug!(task_id = %task.id, "Stale task changed during sweep, leaving it");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        if task.status == TaskStatus::Cancelled {
            self.ledger.close_pending(task.id, TASK_CANCELLED).await?;
        }
        Ok(Some(task))
    }

    /// Approve a gated action. Its parked task becomes claimable again.
    pub async fn approve_action(&self, action_id: Uuid, approver: &str) -> DomainResult<Action> {
        self.ledger.approve(action_id, approver).await
    }

    /// Reject a gated action and resolve its task per the tool's policy.
    pub async fn reject_action(&self, action_id: Uuid, reason: &str) -> DomainResult<(Action, Task)> {
        let action = self.ledger.reject(action_id, reason).await?;
        let policy = self
            .registry
            .get(&action.tool_name)
            .map(|tool| tool.on_rejection)
            .unwrap_or_default();

        let rejection = DomainError::ApprovalRejected {
            action_id,
            reason: reason.to_string(),
        };
        let task = self
            .mutate(action.task_id, |task, now| {
                if task.is_terminal() {
                    return Ok(Mutation::Unchanged);
                }
                match policy {
                    RejectionPolicy::FailTask => {
                        task.status = TaskStatus::Failed;
                        task.error_message = Some(rejection.to_string());
                        task.error_details = Some(serde_json::json!({
                            "action_id": action_id,
                            "rejection_reason": reason,
                        }));
                    }
                    RejectionPolicy::CancelTask => {
                        task.status = TaskStatus::Cancelled;
                        task.cancel_requested_at.get_or_insert(now);
                    }
                }
                task.completed_at = Some(now);
                task.next_retry_at = None;
                Self::release_claim(task);
                Ok(Mutation::Write)
            })
            .await?;

        let closing_reason = match task.status {
            TaskStatus::Cancelled => TASK_CANCELLED,
            TaskStatus::Failed => TASK_REJECTED,
            _ => TASK_FINISHED,
        };
        self.ledger.close_pending(task.id, closing_reason).await?;
        info!(task_id = %task.id, action_id = %action_id, status = %task.status, "Task resolved after rejection");
        Ok((action, task))
    }

    fn ensure_running(task: &Task, claim_token: Option<Uuid>) -> DomainResult<()> {
        if task.status != TaskStatus::Running {
            return Err(DomainError::InvalidState {
                entity: "task",
                id: task.id,
                reason: format!("task is {}, not running", task.status),
            });
        }
        if let Some(token) = claim_token {
            if task.claim_token != Some(token) {
                return Err(DomainError::StaleClaim { task_id: task.id });
            }
        }
        Ok(())
    }

    fn release_claim(task: &mut Task) {
        task.claim_token = None;
        task.heartbeat_at = None;
    }

    /// Read-modify-write under the row version, retrying on contention.
    async fn mutate<F>(&self, id: Uuid, mut apply: F) -> DomainResult<Task>
    where
        F: FnMut(&mut Task, DateTime<Utc>) -> DomainResult<Mutation> + Send,
    {
        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let mut task = self.get(id).await?;
            let before = task.status;
            let now = Utc::now();

            if let Mutation::Unchanged = apply(&mut task, now)? {
                return Ok(task);
            }
            if task.status != before && !before.can_transition_to(task.status) {
                return Err(DomainError::InvalidState {
                    entity: "task",
                    id,
                    reason: format!("transition {before} -> {} is not allowed", task.status),
                });
            }

            task.updated_at = now;
            match self.task_repo.update(&task).await {
                Ok(version) => {
                    task.version = version;
                    return Ok(task);
                }
                Err(DomainError::ConcurrencyConflict { .. }) => {
                    debug!(task_id = %id, attempt, "Task changed concurrently, re-reading");
                }
                Err(e) => return Err(e),
            }
        }

        Err(DomainError::ConcurrencyConflict { entity: "task", id })
    }
}
