//! SQLite implementation of the TaskRepository.
//!
//! SQLite has no `SKIP LOCKED`, so the claim protocol is a per-row
//! compare-and-swap: candidates are read in priority order, then each is
//! taken with a conditional `UPDATE ... RETURNING`. A row another dispatcher
//! took first simply fails the condition and is skipped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    format_datetime, format_optional_datetime, parse_datetime, parse_json_or_default,
    parse_optional_datetime, parse_optional_json, parse_optional_uuid, parse_uuid,
};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{EntityRef, Task, TaskMetrics, TaskStatus};
use crate::domain::ports::{ClaimRequest, Heartbeat, TaskFilter, TaskRepository};

/// Upper bound on select-then-swap rounds per claim call.
const MAX_CLAIM_ROUNDS: usize = 8;

/// Gated actions with no decision yet hold their task out of the claim set.
const AWAITING_APPROVAL: &str = "EXISTS (SELECT 1 FROM actions a
    WHERE a.task_id = t.id AND a.status = 'pending' AND a.requires_approval = 1
      AND a.approved_at IS NULL AND a.rejection_reason IS NULL)";

/// SQLite-backed task store and claim protocol.
#[derive(Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    /// Wrap a pool that has already been migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Due, unclaimed candidates in claim order.
    async fn select_candidates(
        &self,
        request: &ClaimRequest,
        limit: usize,
    ) -> DomainResult<Vec<(String, i64)>> {
        let now = format_datetime(request.now);
        let mut query = format!(
            "SELECT t.id, t.version FROM tasks t
             WHERE t.status IN ('pending', 'scheduled')
               AND (t.scheduled_for IS NULL OR t.scheduled_for <= ?)
               AND (t.next_retry_at IS NULL OR t.next_retry_at <= ?)
               AND NOT {AWAITING_APPROVAL}"
        );
        let mut bindings: Vec<String> = vec![now.clone(), now];

        if let Some(tenant_id) = &request.tenant_id {
            query.push_str(" AND t.tenant_id = ?");
            bindings.push(tenant_id.clone());
        }
        if !request.excluded_task_types.is_empty() {
            let placeholders = vec!["?"; request.excluded_task_types.len()].join(", ");
            query.push_str(&format!(" AND t.task_type NOT IN ({placeholders})"));
            bindings.extend(request.excluded_task_types.iter().cloned());
        }

        query.push_str(&format!(
            " ORDER BY t.priority ASC, t.created_at ASC, t.rowid ASC LIMIT {limit}"
        ));

        let mut q = sqlx::query_as::<_, (String, i64)>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }
        Ok(q.fetch_all(&self.pool).await?)
    }

    /// Compare-and-swap one candidate into `running`. `None` means another
    /// caller changed the row since it was read.
    async fn try_claim(
        &self,
        id: &str,
        version: i64,
        now: DateTime<Utc>,
    ) -> DomainResult<Option<Task>> {
        let now = format_datetime(now);
        let row: Option<TaskRow> = sqlx::query_as(
            r#"UPDATE tasks SET status = 'running', started_at = ?, heartbeat_at = ?,
               claim_token = ?, next_retry_at = NULL, version = version + 1, updated_at = ?
               WHERE id = ? AND status IN ('pending', 'scheduled') AND version = ?
               RETURNING *"#,
        )
        .bind(&now)
        .bind(&now)
        .bind(Uuid::new_v4().to_string())
        .bind(&now)
        .bind(id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::try_from).transpose()
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> DomainResult<()> {
        let metrics_json = serde_json::to_string(&task.metrics)?;
        let (target_type, target_id) = split_target(task.target.as_ref());

        sqlx::query(
            r#"INSERT INTO tasks (id, tenant_id, task_type, status, priority, input, output,
               target_type, target_id, scheduled_for, started_at, completed_at, retry_count,
               max_retries, next_retry_at, metrics, error_message, error_details, claim_token,
               heartbeat_at, cancel_requested_at, version, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(&task.tenant_id)
        .bind(&task.task_type)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(serde_json::to_string(&task.input)?)
        .bind(task.output.as_ref().map(serde_json::to_string).transpose()?)
        .bind(target_type)
        .bind(target_id)
        .bind(format_optional_datetime(task.scheduled_for))
        .bind(format_optional_datetime(task.started_at))
        .bind(format_optional_datetime(task.completed_at))
        .bind(task.retry_count as i64)
        .bind(task.max_retries as i64)
        .bind(format_optional_datetime(task.next_retry_at))
        .bind(&metrics_json)
        .bind(&task.error_message)
        .bind(task.error_details.as_ref().map(serde_json::to_string).transpose()?)
        .bind(task.claim_token.map(|t| t.to_string()))
        .bind(format_optional_datetime(task.heartbeat_at))
        .bind(format_optional_datetime(task.cancel_requested_at))
        .bind(task.version as i64)
        .bind(format_datetime(task.created_at))
        .bind(format_datetime(task.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Task::try_from).transpose()
    }

    async fn update(&self, task: &Task) -> DomainResult<u64> {
        let metrics_json = serde_json::to_string(&task.metrics)?;
        let (target_type, target_id) = split_target(task.target.as_ref());

        let result = sqlx::query(
            r#"UPDATE tasks SET status = ?, priority = ?, input = ?, output = ?,
               target_type = ?, target_id = ?, scheduled_for = ?, started_at = ?,
               completed_at = ?, retry_count = ?, max_retries = ?, next_retry_at = ?,
               metrics = ?, error_message = ?, error_details = ?, claim_token = ?,
               heartbeat_at = ?, cancel_requested_at = ?, version = version + 1, updated_at = ?
               WHERE id = ? AND version = ?"#,
        )
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(serde_json::to_string(&task.input)?)
        .bind(task.output.as_ref().map(serde_json::to_string).transpose()?)
        .bind(target_type)
        .bind(target_id)
        .bind(format_optional_datetime(task.scheduled_for))
        .bind(format_optional_datetime(task.started_at))
        .bind(format_optional_datetime(task.completed_at))
        .bind(task.retry_count as i64)
        .bind(task.max_retries as i64)
        .bind(format_optional_datetime(task.next_retry_at))
        .bind(&metrics_json)
        .bind(&task.error_message)
        .bind(task.error_details.as_ref().map(serde_json::to_string).transpose()?)
        .bind(task.claim_token.map(|t| t.to_string()))
        .bind(format_optional_datetime(task.heartbeat_at))
        .bind(format_optional_datetime(task.cancel_requested_at))
        .bind(format_datetime(task.updated_at))
        .bind(task.id.to_string())
        .bind(task.version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(task.id).await? {
                Some(_) => Err(DomainError::ConcurrencyConflict { entity: "task", id: task.id }),
                None => Err(DomainError::TaskNotFound(task.id)),
            };
        }

        Ok(task.version + 1)
    }

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        let mut query = String::from("SELECT * FROM tasks WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if let Some(tenant_id) = &filter.tenant_id {
            query.push_str(" AND tenant_id = ?");
            bindings.push(tenant_id.clone());
        }
        if let Some(status) = &filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.as_str().to_string());
        }
        if let Some(task_type) = &filter.task_type {
            query.push_str(" AND task_type = ?");
            bindings.push(task_type.clone());
        }

        query.push_str(" ORDER BY created_at DESC, rowid DESC");
        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {}", limit.max(0)));
        }

        let mut q = sqlx::query_as::<_, TaskRow>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }

        let rows: Vec<TaskRow> = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn count_created_since(&self, tenant_id: &str, since: DateTime<Utc>) -> DomainResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE tenant_id = ? AND created_at >= ?")
                .bind(tenant_id)
                .bind(format_datetime(since))
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn count_running(&self, tenant_id: &str) -> DomainResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE tenant_id = ? AND status = 'running'")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn count_by_status(&self, tenant_id: Option<&str>) -> DomainResult<HashMap<TaskStatus, u64>> {
        let rows: Vec<(String, i64)> = match tenant_id {
            Some(tenant_id) => {
                sqlx::query_as("SELECT status, COUNT(*) FROM tasks WHERE tenant_id = ? GROUP BY status")
                    .bind(tenant_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut counts = HashMap::new();
        for (status_str, count) in rows {
            if let Some(status) = TaskStatus::from_str(&status_str) {
                counts.insert(status, count as u64);
            }
        }
        Ok(counts)
    }

    async fn claim(&self, request: ClaimRequest) -> DomainResult<Vec<Task>> {
        let mut claimed: Vec<Task> = Vec::with_capacity(request.limit);

        for round in 0..MAX_CLAIM_ROUNDS {
            let remaining = request.limit - claimed.len();
            if remaining == 0 {
                break;
            }

            let candidates = self.select_candidates(&request, remaining).await?;
            if candidates.is_empty() {
                break;
            }

            let mut lost = 0usize;
            for (id, version) in &candidates {
                if claimed.len() == request.limit {
                    break;
                }
                match self.try_claim(id, *version, request.now).await? {
                    Some(task) => claimed.push(task),
                    None => {
                        trace!(task_id = %id, "Claim lost to another dispatcher, skipping");
                        lost += 1;
                    }
                }
            }

            // Nothing was contended, so there is nothing more to find.
            if lost == 0 {
                break;
            }
            debug!(round, lost, "Claim round saw contention, retrying with fresh candidates");
        }

        Ok(claimed)
    }

    async fn heartbeat(&self, id: Uuid, claim_token: Uuid, now: DateTime<Utc>) -> DomainResult<Heartbeat> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            r#"UPDATE tasks SET heartbeat_at = ?, version = version + 1
               WHERE id = ? AND claim_token = ? AND status = 'running'
               RETURNING cancel_requested_at"#,
        )
        .bind(format_datetime(now))
        .bind(id.to_string())
        .bind(claim_token.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Err(DomainError::StaleClaim { task_id: id }),
            Some((None,)) => Ok(Heartbeat::Continue),
            Some((Some(_),)) => Ok(Heartbeat::CancelRequested),
        }
    }

    async fn list_stale_running(&self, threshold: DateTime<Utc>) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"SELECT * FROM tasks
               WHERE status = 'running' AND COALESCE(heartbeat_at, started_at, updated_at) < ?
               ORDER BY COALESCE(heartbeat_at, started_at, updated_at) ASC"#,
        )
        .bind(format_datetime(threshold))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Task::try_from).collect()
    }
}

fn split_target(target: Option<&EntityRef>) -> (Option<String>, Option<String>) {
    match target {
        Some(t) => (Some(t.entity_type.clone()), Some(t.entity_id.clone())),
        None => (None, None),
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    tenant_id: String,
    task_type: String,
    status: String,
    priority: i64,
    input: String,
    output: Option<String>,
    target_type: Option<String>,
    target_id: Option<String>,
    scheduled_for: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    retry_count: i64,
    max_retries: i64,
    next_retry_at: Option<String>,
    metrics: Option<String>,
    error_message: Option<String>,
    error_details: Option<String>,
    claim_token: Option<String>,
    heartbeat_at: Option<String>,
    cancel_requested_at: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;

        let target = match (row.target_type, row.target_id) {
            (Some(entity_type), Some(entity_id)) => Some(EntityRef { entity_type, entity_id }),
            _ => None,
        };

        let metrics: TaskMetrics = parse_json_or_default(row.metrics)?;

        Ok(Task {
            id: parse_uuid(&row.id)?,
            tenant_id: row.tenant_id,
            task_type: row.task_type,
            status,
            priority: row.priority as i32,
            input: serde_json::from_str(&row.input)?,
            output: parse_optional_json(row.output)?,
            target,
            scheduled_for: parse_optional_datetime(row.scheduled_for)?,
            started_at: parse_optional_datetime(row.started_at)?,
            completed_at: parse_optional_datetime(row.completed_at)?,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            next_retry_at: parse_optional_datetime(row.next_retry_at)?,
            metrics,
            error_message: row.error_message,
            error_details: parse_optional_json(row.error_details)?,
            claim_token: parse_optional_uuid(row.claim_token)?,
            heartbeat_at: parse_optional_datetime(row.heartbeat_at)?,
            cancel_requested_at: parse_optional_datetime(row.cancel_requested_at)?,
            version: row.version as u64,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteActionRepository};
    use crate::domain::models::{Action, ActionStatus};
    use crate::domain::ports::ActionRepository;
    use chrono::Duration;
    use serde_json::json;

    async fn setup_test_repo() -> SqliteTaskRepository {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteTaskRepository::new(pool)
    }

    #[tokio::test]
    async fn test_create_and_get_task() {
        let repo = setup_test_repo().await;
        let task = Task::new("acme", "summarize_report", json!({"report": "q3"}))
            .with_target(EntityRef::new("document", "42"))
            .with_priority(20);

        repo.create(&task).await.unwrap();

        let retrieved = repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(retrieved.task_type, "summarize_report");
        assert_eq!(retrieved.priority, 20);
        assert_eq!(retrieved.target, Some(EntityRef::new("document", "42")));
        assert_eq!(retrieved.input, json!({"report": "q3"}));
        assert_eq!(retrieved.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_update_detects_concurrent_modification() {
        let repo = setup_test_repo().await;
        let task = Task::new("acme", "t", json!(null));
        repo.create(&task).await.unwrap();

        let mut first = repo.get(task.id).await.unwrap().unwrap();
        let mut second = first.clone();

        first.priority = 10;
        assert_eq!(repo.update(&first).await.unwrap(), 2);

        second.priority = 90;
        let err = repo.update(&second).await.unwrap_err();
        assert!(matches!(err, DomainError::ConcurrencyConflict { .. }));
        assert_eq!(repo.get(task.id).await.unwrap().unwrap().priority, 10);
    }

    #[tokio::test]
    async fn test_claim_takes_most_urgent_first() {
        let repo = setup_test_repo().await;
        let low = Task::new("acme", "t", json!(null)).with_priority(10);
        let high = Task::new("acme", "t", json!(null)).with_priority(1);
        repo.create(&low).await.unwrap();
        repo.create(&high).await.unwrap();

        let claimed = repo.claim(ClaimRequest::for_tenant("acme", 1)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, high.id);
        assert_eq!(claimed[0].status, TaskStatus::Running);
        assert!(claimed[0].claim_token.is_some());
        assert!(claimed[0].started_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_is_fifo_within_priority() {
        let repo = setup_test_repo().await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let task = Task::new("acme", "t", json!(null));
            ids.push(task.id);
            repo.create(&task).await.unwrap();
        }

        let claimed = repo.claim(ClaimRequest::for_tenant("acme", 3)).await.unwrap();
        let claimed_ids: Vec<_> = claimed.iter().map(|t| t.id).collect();
        assert_eq!(claimed_ids, ids);
    }

    #[tokio::test]
    async fn test_claim_skips_tasks_not_yet_due() {
        let repo = setup_test_repo().await;
        let now = Utc::now();
        let later = Task::new("acme", "t", json!(null)).with_scheduled_for(now + Duration::hours(1));
        let mut backing_off = Task::new("acme", "t", json!(null));
        backing_off.retry_count = 1;
        backing_off.next_retry_at = Some(now + Duration::minutes(5));
        repo.create(&later).await.unwrap();
        repo.create(&backing_off).await.unwrap();

        let claimed = repo.claim(ClaimRequest::for_tenant("acme", 10)).await.unwrap();
        assert!(claimed.is_empty());

        let mut request = ClaimRequest::for_tenant("acme", 10);
        request.now = now + Duration::hours(2);
        let claimed = repo.claim(request).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|t| t.next_retry_at.is_none()));
    }

    #[tokio::test]
    async fn test_claim_respects_tenant_and_exclusions() {
        let repo = setup_test_repo().await;
        let other_tenant = Task::new("globex", "t", json!(null));
        let excluded = Task::new("acme", "nightly_digest", json!(null));
        let wanted = Task::new("acme", "classify", json!(null));
        for task in [&other_tenant, &excluded, &wanted] {
            repo.create(task).await.unwrap();
        }

        let request = ClaimRequest::for_tenant("acme", 10).excluding(vec!["nightly_digest".to_string()]);
        let claimed = repo.claim(request).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, wanted.id);
    }

    #[tokio::test]
    async fn test_claim_skips_task_awaiting_approval() {
        let pool = create_migrated_test_pool().await.unwrap();
        let repo = SqliteTaskRepository::new(pool.clone());
        let actions = SqliteActionRepository::new(pool);

        let task = Task::new("acme", "send_rfi", json!(null));
        repo.create(&task).await.unwrap();
        let mut action = Action::new(task.id, "send_rfi", "tool_call", json!({})).with_approval_required(true);
        actions.create(&action).await.unwrap();

        assert!(repo.claim(ClaimRequest::any_tenant(10)).await.unwrap().is_empty());

        action.approved_by = Some("pm-1".to_string());
        action.approved_at = Some(Utc::now());
        assert!(actions.update_if_status(&action, ActionStatus::Pending).await.unwrap());

        let claimed = repo.claim(ClaimRequest::any_tenant(10)).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_reports_cancellation_and_stale_claims() {
        let repo = setup_test_repo().await;
        let task = Task::new("acme", "t", json!(null));
        repo.create(&task).await.unwrap();
        let claimed = repo.claim(ClaimRequest::any_tenant(1)).await.unwrap().remove(0);
        let token = claimed.claim_token.unwrap();

        assert_eq!(repo.heartbeat(task.id, token, Utc::now()).await.unwrap(), Heartbeat::Continue);

        let mut current = repo.get(task.id).await.unwrap().unwrap();
        current.cancel_requested_at = Some(Utc::now());
        repo.update(&current).await.unwrap();
        assert_eq!(
            repo.heartbeat(task.id, token, Utc::now()).await.unwrap(),
            Heartbeat::CancelRequested
        );

        let err = repo.heartbeat(task.id, Uuid::new_v4(), Utc::now()).await.unwrap_err();
        assert!(matches!(err, DomainError::StaleClaim { .. }));
    }

    #[tokio::test]
    async fn test_stale_running_uses_last_heartbeat() {
        let repo = setup_test_repo().await;
        let task = Task::new("acme", "t", json!(null));
        repo.create(&task).await.unwrap();

        let mut request = ClaimRequest::any_tenant(1);
        request.now = Utc::now() - Duration::minutes(30);
        let claimed = repo.claim(request).await.unwrap().remove(0);
        let threshold = Utc::now() - Duration::minutes(15);

        assert_eq!(repo.list_stale_running(threshold).await.unwrap().len(), 1);

        repo.heartbeat(task.id, claimed.claim_token.unwrap(), Utc::now()).await.unwrap();
        assert!(repo.list_stale_running(threshold).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_counts() {
        let repo = setup_test_repo().await;
        for _ in 0..3 {
            repo.create(&Task::new("acme", "t", json!(null))).await.unwrap();
        }
        repo.create(&Task::new("globex", "t", json!(null))).await.unwrap();
        repo.claim(ClaimRequest::for_tenant("acme", 1)).await.unwrap();

        let since = Utc::now() - Duration::hours(1);
        assert_eq!(repo.count_created_since("acme", since).await.unwrap(), 3);
        assert_eq!(repo.count_running("acme").await.unwrap(), 1);

        let counts = repo.count_by_status(Some("acme")).await.unwrap();
        assert_eq!(counts.get(&TaskStatus::Pending), Some(&2));
        assert_eq!(counts.get(&TaskStatus::Running), Some(&1));

        let all = repo.count_by_status(None).await.unwrap();
        assert_eq!(all.get(&TaskStatus::Pending), Some(&3));
    }
}
