//! Runs one claimed task through its tool.
//!
//! The executor records the action, honours the approval gate, heartbeats
//! while the tool runs, and reports the result through [`TaskService`]. When
//! the claim is lost mid-run it stops without writing anything; the task
//! already belongs to someone else.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    ActionStatus, ApprovalState, Task, TaskMetrics, TaskStatus, TenantConfig,
};
use crate::domain::ports::{
    ActionRepository, Heartbeat, TaskRepository, TenantConfigRepository, ToolContext, ToolError,
};
use crate::services::task_service::{FailureReport, TaskService};

/// How a single execution ended, from the dispatcher's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Tool succeeded, or a prior execution was reused
    Completed,
    /// Failed and requeued with backoff
    Retrying,
    /// Retry budget exhausted, or a permanent error
    Failed,
    /// Cancelled before or during execution
    Cancelled,
    /// Waiting on an approval decision
    Parked,
    /// The claim was lost; nothing was written
    Abandoned,
}

impl ExecutionOutcome {
    fn from_status(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Completed => Self::Completed,
            TaskStatus::Failed => Self::Failed,
            TaskStatus::Cancelled => Self::Cancelled,
            TaskStatus::Pending | TaskStatus::Scheduled => Self::Retrying,
            TaskStatus::Running => Self::Abandoned,
        }
    }
}

/// Runs one claimed task through its tool.
pub struct Executor<T: TaskRepository, A: ActionRepository, C: TenantConfigRepository> {
    tasks: Arc<TaskService<T, A, C>>,
    heartbeat_interval: Duration,
}

impl<T, A, C> Executor<T, A, C>
where
    T: TaskRepository + 'static,
    A: ActionRepository + 'static,
    C: TenantConfigRepository + 'static,
{
    /// `heartbeat_interval` paces heartbeats while the tool runs.
    pub fn new(tasks: Arc<TaskService<T, A, C>>, heartbeat_interval: Duration) -> Self {
        Self {
            tasks,
            heartbeat_interval,
        }
    }

    /// Execute a task claimed by this process. `config` is the tenant's entry
    /// from the cycle's snapshot.
    #[instrument(skip_all, fields(task_id = %task.id, task_type = %task.task_type))]
    pub async fn execute(&self, task: Task, config: Option<&TenantConfig>) -> DomainResult<ExecutionOutcome> {
        let Some(claim) = task.claim_token else {
            return Err(DomainError::InvalidState {
                entity: "task",
                id: task.id,
                reason: "task has no claim".to_string(),
            });
        };
        Self::settle(self.run(&task, claim, config).await)
    }

    async fn run(&self, task: &Task, claim: Uuid, config: Option<&TenantConfig>) -> DomainResult<ExecutionOutcome> {
        let Some(tool) = self.tasks.registry().get(&task.task_type).cloned() else {
            let report = FailureReport::permanent(format!("No tool registered for task type {}", task.task_type));
            let failed = self.tasks.fail(task.id, Some(claim), report).await?;
            return Ok(ExecutionOutcome::from_status(failed.status));
        };

        let autonomy = config.map(|c| c.autonomy_level).unwrap_or_default();
        let requires_approval = autonomy.requires_approval(tool.requires_approval);
        let ledger = self.tasks.ledger();

        let action = match ledger.latest_attempt(task, &tool.name).await? {
            Some(previous) if previous.status == ActionStatus::Executed => {
                info!(action_id = %previous.id, "Tool already ran for this task, reusing its output");
                let output = previous.output.unwrap_or(Value::Null);
                self.tasks.complete(task.id, Some(claim), output, TaskMetrics::default()).await?;
                return Ok(ExecutionOutcome::Completed);
            }
            Some(previous) if previous.status == ActionStatus::Pending => {
                debug!(action_id = %previous.id, "Resuming pending action");
                previous
            }
            _ => ledger.record_attempt(task, &tool.name, requires_approval).await?,
        };

        if action.approval_state() == ApprovalState::AwaitingApproval {
            self.tasks.park(task.id, claim).await?;
            return Ok(ExecutionOutcome::Parked);
        }

        if self.tasks.heartbeat(task.id, claim).await? == Heartbeat::CancelRequested {
            self.tasks.finalize_cancelled(task.id, Some(claim)).await?;
            return Ok(ExecutionOutcome::Cancelled);
        }

        let cancellation = CancellationToken::new();
        let ctx = ToolContext {
            task_id: task.id,
            action_id: action.id,
            tenant_id: task.tenant_id.clone(),
            target: task.target.clone(),
            input: task.input.clone(),
            cancellation: cancellation.clone(),
        };
        let handler = tool.handler.clone();
        let invocation = handler.invoke(ctx);
        tokio::pin!(invocation);

        let mut ticker = interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut cancel_requested = false;
        let result = loop {
            tokio::select! {
                result = &mut invocation => break result,
                _ = ticker.tick() => {
                    match self.tasks.heartbeat(task.id, claim).await {
                        Ok(Heartbeat::Continue) => {}
                        Ok(Heartbeat::CancelRequested) => {
                            if !cancel_requested {
                                info!("Cancellation requested, signalling tool");
                                cancel_requested = true;
                                cancellation.cancel();
                            }
                        }
                        Err(DomainError::StaleClaim { .. }) => {
                            warn!("Claim lost while tool was running, abandoning");
                            cancellation.cancel();
                            return Ok(ExecutionOutcome::Abandoned);
                        }
                        Err(e) => warn!(error = %e, "Heartbeat failed, will retry at next tick"),
                    }
                }
            }
        };

        match result {
            Ok(out) => {
                ledger.mark_executed(&action, out.output.clone()).await?;
                let completed = self.tasks.complete(task.id, Some(claim), out.output, out.metrics).await?;
                Ok(ExecutionOutcome::from_status(completed.status))
            }
            Err(error) if cancel_requested || matches!(error, ToolError::Cancelled) => {
                ledger.mark_failed(&action, &error.to_string()).await?;
                self.tasks.finalize_cancelled(task.id, Some(claim)).await?;
                Ok(ExecutionOutcome::Cancelled)
            }
            Err(error) => {
                ledger.mark_failed(&action, &error.to_string()).await?;
                let report = FailureReport {
                    message: error.to_string(),
                    details: match &error {
                        ToolError::Failed { details, .. } => details.clone(),
                        ToolError::Cancelled => None,
                    },
                    retryable: tool.is_retryable(&error),
                };
                let failed = self.tasks.fail(task.id, Some(claim), report).await?;
                Ok(ExecutionOutcome::from_status(failed.status))
            }
        }
    }

    /// A write refused because the claim moved on means the sweep or another
    /// worker owns the task now.
    fn settle(result: DomainResult<ExecutionOutcome>) -> DomainResult<ExecutionOutcome> {
        match result {
            Err(DomainError::StaleClaim { task_id }) => {
                warn!(%task_id, "Stale claim, abandoning task");
                Ok(ExecutionOutcome::Abandoned)
            }
            Err(DomainError::InvalidState { entity: "task", id, reason }) => {
                warn!(task_id = %id, %reason, "Task moved on during execution, abandoning");
                Ok(ExecutionOutcome::Abandoned)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{
        create_migrated_test_pool, SqliteActionRepository, SqliteTaskRepository,
        SqliteTenantConfigRepository,
    };
    use crate::domain::models::AutonomyLevel;
    use crate::domain::ports::{ClaimRequest, ToolHandler, ToolOutput};
    use crate::services::task_service::NewTask;
    use crate::services::tool_registry::{ToolDefinition, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail_with: Option<ToolError>,
    }

    #[async_trait]
    impl ToolHandler for Counting {
        async fn invoke(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(error) => Err(error.clone()),
                None => Ok(ToolOutput::new(json!({"echo": ctx.input}))),
            }
        }
    }

    struct WaitForCancel;

    #[async_trait]
    impl ToolHandler for WaitForCancel {
        async fn invoke(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
            ctx.cancellation.cancelled().await;
            Err(ToolError::Cancelled)
        }
    }

    type Exec = Executor<SqliteTaskRepository, SqliteActionRepository, SqliteTenantConfigRepository>;

    struct Harness {
        executor: Exec,
        service: Arc<TaskService<SqliteTaskRepository, SqliteActionRepository, SqliteTenantConfigRepository>>,
        repo: Arc<SqliteTaskRepository>,
        config: TenantConfig,
    }

    async fn harness(registry: ToolRegistry, autonomy: AutonomyLevel) -> Harness {
        let pool = create_migrated_test_pool().await.unwrap();
        let repo = Arc::new(SqliteTaskRepository::new(pool.clone()));
        let configs = Arc::new(SqliteTenantConfigRepository::new(pool.clone()));
        let mut config = TenantConfig::new("acme").with_feature("docs");
        config.autonomy_level = autonomy;
        configs.upsert(&config).await.unwrap();

        let service = Arc::new(TaskService::new(
            repo.clone(),
            Arc::new(SqliteActionRepository::new(pool)),
            configs,
            Arc::new(registry),
        ));
        Harness {
            executor: Executor::new(service.clone(), Duration::from_millis(20)),
            service,
            repo,
            config,
        }
    }

    impl Harness {
        async fn claim_one(&self, task_type: &str) -> Task {
            self.service.create(NewTask::new("acme", task_type, json!({"n": 1}))).await.unwrap();
            self.repo.claim(ClaimRequest::for_tenant("acme", 1)).await.unwrap().remove(0)
        }
    }

    fn counting(fail_with: Option<ToolError>) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail_with,
        })
    }

    #[tokio::test]
    async fn test_success_records_executed_action() {
        let tool = counting(None);
        let registry = ToolRegistry::new()
            .with_tool(ToolDefinition::new("classify", "docs", tool.clone()))
            .unwrap();
        let h = harness(registry, AutonomyLevel::Autonomous).await;
        let task = h.claim_one("classify").await;

        let outcome = h.executor.execute(task.clone(), Some(&h.config)).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);

        let stored = h.service.get(task.id).await.unwrap();
        assert_eq!(stored.output, Some(json!({"echo": {"n": 1}})));
        let action = h.service.ledger().latest_attempt(&stored, "classify").await.unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Executed);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_requeues() {
        let tool = counting(Some(ToolError::transient("upstream timeout")));
        let registry = ToolRegistry::new()
            .with_tool(ToolDefinition::new("classify", "docs", tool))
            .unwrap();
        let h = harness(registry, AutonomyLevel::Autonomous).await;
        let task = h.claim_one("classify").await;

        let outcome = h.executor.execute(task.clone(), Some(&h.config)).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Retrying);
        let stored = h.service.get(task.id).await.unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.error_message.as_deref(), Some("upstream timeout"));
    }

    #[tokio::test]
    async fn test_gated_tool_parks_until_approved() {
        let tool = counting(None);
        let registry = ToolRegistry::new()
            .with_tool(ToolDefinition::new("send_rfi", "docs", tool.clone()).with_approval_required(true))
            .unwrap();
        let h = harness(registry, AutonomyLevel::ConfirmActions).await;
        let task = h.claim_one("send_rfi").await;

        assert_eq!(h.executor.execute(task.clone(), Some(&h.config)).await.unwrap(), ExecutionOutcome::Parked);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);

        let action = h.service.ledger().latest_attempt(&task, "send_rfi").await.unwrap().unwrap();
        h.service.approve_action(action.id, "pm-1").await.unwrap();

        let reclaimed = h.repo.claim(ClaimRequest::for_tenant("acme", 1)).await.unwrap().remove(0);
        assert_eq!(h.executor.execute(reclaimed, Some(&h.config)).await.unwrap(), ExecutionOutcome::Completed);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);

        let executed = h.service.ledger().get(action.id).await.unwrap();
        assert_eq!(executed.status, ActionStatus::Executed);
        assert_eq!(executed.approved_by.as_deref(), Some("pm-1"));
    }

    #[tokio::test]
    async fn test_executed_action_is_not_repeated() {
        let tool = counting(None);
        let registry = ToolRegistry::new()
            .with_tool(ToolDefinition::new("classify", "docs", tool.clone()))
            .unwrap();
        let h = harness(registry, AutonomyLevel::Autonomous).await;
        let task = h.claim_one("classify").await;

        // The tool ran but the worker died before completing the task.
        let action = h.service.ledger().record_attempt(&task, "classify", false).await.unwrap();
        h.service.ledger().mark_executed(&action, json!("done")).await.unwrap();
        h.service.recover_orphan(&task).await.unwrap().unwrap();

        let reclaimed = h.repo.claim(ClaimRequest::for_tenant("acme", 1)).await.unwrap().remove(0);
        assert_eq!(h.executor.execute(reclaimed, Some(&h.config)).await.unwrap(), ExecutionOutcome::Completed);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.service.get(task.id).await.unwrap().output, Some(json!("done")));
    }

    #[tokio::test]
    async fn test_cancel_reaches_running_tool() {
        let registry = ToolRegistry::new()
            .with_tool(ToolDefinition::new("digest", "docs", Arc::new(WaitForCancel)))
            .unwrap();
        let h = harness(registry, AutonomyLevel::Autonomous).await;
        let task = h.claim_one("digest").await;

        let service = h.service.clone();
        let id = task.id;
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            service.cancel(id).await.unwrap();
        });

        let outcome = h.executor.execute(task, Some(&h.config)).await.unwrap();
        canceller.await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Cancelled);
        assert_eq!(h.service.get(id).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_lost_claim_is_abandoned() {
        let tool = counting(None);
        let registry = ToolRegistry::new()
            .with_tool(ToolDefinition::new("classify", "docs", tool.clone()))
            .unwrap();
        let h = harness(registry, AutonomyLevel::Autonomous).await;
        let task = h.claim_one("classify").await;
        h.service.recover_orphan(&task).await.unwrap().unwrap();

        assert_eq!(h.executor.execute(task.clone(), Some(&h.config)).await.unwrap(), ExecutionOutcome::Abandoned);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.service.get(task.id).await.unwrap().status, TaskStatus::Pending);
    }
}
