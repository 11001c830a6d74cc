//! Approval-gated actions never execute without a recorded approval.

mod helpers;

use std::sync::Arc;

use serde_json::json;

use foreman::domain::errors::DomainError;
use foreman::domain::models::{
    Action, ActionStatus, ApprovalState, AutonomyLevel, DispatcherConfig, EntityRef, Task, TaskStatus,
};
use foreman::domain::ports::ActionFilter;
use foreman::services::{Dispatcher, NewTask, RejectionPolicy, ToolDefinition, ToolRegistry};

use helpers::database::{open_tenant, setup_test_db, Stack};
use helpers::tools::CountingTool;

struct Gated {
    stack: Stack,
    tool: Arc<CountingTool>,
    dispatcher: Dispatcher<
        foreman::adapters::sqlite::SqliteTaskRepository,
        foreman::adapters::sqlite::SqliteActionRepository,
        foreman::adapters::sqlite::SqliteTenantConfigRepository,
    >,
}

impl Gated {
    async fn new(autonomy: AutonomyLevel, rejection: RejectionPolicy) -> Self {
        let tool = Arc::new(CountingTool::default());
        let registry = ToolRegistry::new()
            .with_tool(
                ToolDefinition::new("send_rfi", "rfi", tool.clone())
                    .with_approval_required(true)
                    .on_rejection(rejection),
            )
            .unwrap()
            .with_tool(ToolDefinition::new("classify", "rfi", tool.clone()))
            .unwrap();
        let stack = Stack::new(setup_test_db().await, registry);
        let mut tenant = open_tenant("acme", &["rfi"]);
        tenant.autonomy_level = autonomy;
        stack.configure(&tenant).await;

        let dispatcher = Dispatcher::new(
            stack.tasks.clone(),
            stack.task_repo.clone(),
            stack.config_repo.clone(),
            DispatcherConfig {
                poll_interval_secs: 1,
                batch_size: 10,
                max_workers: 2,
                heartbeat_interval_secs: 1,
            },
        );
        Self { stack, tool, dispatcher }
    }

    async fn submit(&self, task_type: &str) -> Task {
        self.stack
            .tasks
            .create(NewTask::new("acme", task_type, json!({"to": "architect"})).with_target(EntityRef::new("rfi", "42")))
            .await
            .unwrap()
    }

    async fn cycle(&self) {
        self.dispatcher.run_cycle().await.unwrap();
        self.dispatcher.wait_idle().await;
    }

    async fn actions(&self, task: &Task) -> Vec<Action> {
        self.stack
            .tasks
            .ledger()
            .list(ActionFilter {
                task_id: Some(task.id),
                ..ActionFilter::default()
            })
            .await
            .unwrap()
    }

    async fn assert_gate_sound(&self) {
        let all = self.stack.tasks.ledger().list(ActionFilter::default()).await.unwrap();
        for action in all {
            if action.requires_approval && action.status == ActionStatus::Executed {
                assert!(action.approved_at.is_some(), "action {} executed without approval", action.id);
            }
        }
    }
}

#[tokio::test]
async fn test_gated_action_waits_for_approval() {
    let gated = Gated::new(AutonomyLevel::ConfirmActions, RejectionPolicy::FailTask).await;
    let task = gated.submit("send_rfi").await;

    gated.cycle().await;
    gated.cycle().await;
    assert_eq!(gated.tool.total(), 0, "tool ran before approval");

    let parked = gated.stack.tasks.get(task.id).await.unwrap();
    assert_eq!(parked.status, TaskStatus::Pending);
    let actions = gated.actions(&task).await;
    assert_eq!(actions.len(), 1, "parking twice must not duplicate the action");
    assert_eq!(actions[0].approval_state(), ApprovalState::AwaitingApproval);
    assert_eq!(actions[0].target, Some(EntityRef::new("rfi", "42")));

    let awaiting = gated
        .stack
        .tasks
        .ledger()
        .list(ActionFilter {
            awaiting_approval: true,
            ..ActionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(awaiting.len(), 1);

    gated.stack.tasks.approve_action(actions[0].id, "pm@acme").await.unwrap();
    gated.cycle().await;

    let done = gated.stack.tasks.get(task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(gated.tool.total(), 1);
    let executed = gated.stack.tasks.ledger().get(actions[0].id).await.unwrap();
    assert_eq!(executed.status, ActionStatus::Executed);
    assert_eq!(executed.approved_by.as_deref(), Some("pm@acme"));
    gated.assert_gate_sound().await;
}

#[tokio::test]
async fn test_rejection_fails_task_by_default() {
    let gated = Gated::new(AutonomyLevel::ConfirmActions, RejectionPolicy::FailTask).await;
    let task = gated.submit("send_rfi").await;
    gated.cycle().await;

    let action = gated.actions(&task).await.remove(0);
    let (rejected, resolved) = gated
        .stack
        .tasks
        .reject_action(action.id, "wrong recipient")
        .await
        .unwrap();

    assert_eq!(rejected.status, ActionStatus::Failed);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("wrong recipient"));
    assert_eq!(resolved.status, TaskStatus::Failed);
    assert!(resolved.completed_at.is_some());

    gated.cycle().await;
    assert_eq!(gated.tool.total(), 0);

    // A decision is final.
    let late = gated.stack.tasks.approve_action(action.id, "pm@acme").await;
    assert!(matches!(late, Err(DomainError::InvalidState { .. })));
    gated.assert_gate_sound().await;
}

#[tokio::test]
async fn test_rejection_can_cancel_task() {
    let gated = Gated::new(AutonomyLevel::ConfirmActions, RejectionPolicy::CancelTask).await;
    let task = gated.submit("send_rfi").await;
    gated.cycle().await;

    let action = gated.actions(&task).await.remove(0);
    let (_, resolved) = gated.stack.tasks.reject_action(action.id, "not needed").await.unwrap();
    assert_eq!(resolved.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_suggest_only_gates_every_tool() {
    let gated = Gated::new(AutonomyLevel::SuggestOnly, RejectionPolicy::FailTask).await;
    let task = gated.submit("classify").await;
    gated.cycle().await;

    assert_eq!(gated.tool.total(), 0);
    let actions = gated.actions(&task).await;
    assert_eq!(actions.len(), 1);
    assert!(actions[0].requires_approval);
    gated.assert_gate_sound().await;
}

#[tokio::test]
async fn test_autonomous_tenant_runs_unflagged_tools() {
    let gated = Gated::new(AutonomyLevel::Autonomous, RejectionPolicy::FailTask).await;
    let task = gated.submit("classify").await;
    gated.cycle().await;

    assert_eq!(gated.stack.tasks.get(task.id).await.unwrap().status, TaskStatus::Completed);
    let actions = gated.actions(&task).await;
    assert_eq!(actions.len(), 1);
    assert!(!actions[0].requires_approval);
    assert_eq!(actions[0].status, ActionStatus::Executed);
}

#[tokio::test]
async fn test_autonomous_tenant_still_gates_flagged_tools() {
    let gated = Gated::new(AutonomyLevel::Autonomous, RejectionPolicy::FailTask).await;
    let task = gated.submit("send_rfi").await;
    gated.cycle().await;

    assert_eq!(gated.tool.total(), 0, "flagged tool ran without approval");
    assert_eq!(gated.stack.tasks.get(task.id).await.unwrap().status, TaskStatus::Pending);
    let actions = gated.actions(&task).await;
    assert_eq!(actions.len(), 1);
    assert!(actions[0].requires_approval);
    assert_eq!(actions[0].approval_state(), ApprovalState::AwaitingApproval);

    gated.stack.tasks.approve_action(actions[0].id, "pm@acme").await.unwrap();
    gated.cycle().await;
    assert_eq!(gated.stack.tasks.get(task.id).await.unwrap().status, TaskStatus::Completed);
    assert_eq!(gated.tool.total(), 1);
    gated.assert_gate_sound().await;
}
