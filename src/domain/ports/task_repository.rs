//! Storage port for tasks, including the claim protocol.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Task, TaskStatus};

/// Filters for querying tasks
#[derive(Default, Debug, Clone)]
pub struct TaskFilter {
    /// Only this tenant
    pub tenant_id: Option<String>,
    /// Only this status
    pub status: Option<TaskStatus>,
    /// Only this task type
    pub task_type: Option<String>,
    /// Maximum rows to return
    pub limit: Option<i64>,
}

/// Input to the claim protocol.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// `None` claims across every tenant
    pub tenant_id: Option<String>,
    /// Maximum tasks to claim
    pub limit: usize,
    /// Reference time for due checks and `started_at`
    pub now: DateTime<Utc>,
    /// Task types that must be left unclaimed this cycle
    pub excluded_task_types: Vec<String>,
}

impl ClaimRequest {
    /// Claim up to `limit` due tasks of one tenant.
    pub fn for_tenant(tenant_id: impl Into<String>, limit: usize) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            limit,
            now: Utc::now(),
            excluded_task_types: Vec::new(),
        }
    }

    /// Claim up to `limit` due tasks across tenants.
    pub fn any_tenant(limit: usize) -> Self {
        Self {
            tenant_id: None,
            limit,
            now: Utc::now(),
            excluded_task_types: Vec::new(),
        }
    }

    /// Leave these task types unclaimed.
    pub fn excluding(mut self, task_types: Vec<String>) -> Self {
        self.excluded_task_types = task_types;
        self
    }
}

/// What a worker learns when it checkpoints a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    /// Claim still held, keep going
    Continue,
    /// Claim still held but cancellation was requested
    CancelRequested,
}

/// Repository port for task persistence operations
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a new task
    async fn create(&self, task: &Task) -> DomainResult<()>;

    /// Get a task by ID
    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>>;

    /// Persist `task` if its stored version still equals `task.version`.
    ///
    /// Returns the new version. Fails with `ConcurrencyConflict` when another
    /// writer got there first.
    async fn update(&self, task: &Task) -> DomainResult<u64>;

    /// List tasks with optional filters, newest first
    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>>;

    /// Count a tenant's tasks created at or after `since`
    async fn count_created_since(&self, tenant_id: &str, since: DateTime<Utc>) -> DomainResult<u64>;

    /// Count a tenant's running tasks
    async fn count_running(&self, tenant_id: &str) -> DomainResult<u64>;

    /// Count tasks per status, optionally for one tenant
    async fn count_by_status(&self, tenant_id: Option<&str>) -> DomainResult<HashMap<TaskStatus, u64>>;

    /// Atomically claim up to `request.limit` due tasks.
    ///
    /// Never returns the same task to two callers and never waits on a row
    /// another caller is taking.
    async fn claim(&self, request: ClaimRequest) -> DomainResult<Vec<Task>>;

    /// Record liveness for a claimed task.
    ///
    /// Fails with `StaleClaim` when `claim_token` no longer owns the task.
    async fn heartbeat(&self, id: Uuid, claim_token: Uuid, now: DateTime<Utc>) -> DomainResult<Heartbeat>;

    /// Running tasks whose last sign of life is older than `threshold`
    async fn list_stale_running(&self, threshold: DateTime<Utc>) -> DomainResult<Vec<Task>>;
}
