//! SQLite implementation of the action ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{
    format_datetime, format_optional_datetime, parse_datetime, parse_optional_datetime,
    parse_optional_json, parse_uuid,
};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Action, ActionStatus, EntityRef};
use crate::domain::ports::{ActionFilter, ActionRepository};

/// SQLite-backed action ledger storage.
#[derive(Clone)]
pub struct SqliteActionRepository {
    pool: SqlitePool,
}

impl SqliteActionRepository {
    /// Wrap a pool that has already been migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActionRepository for SqliteActionRepository {
    async fn create(&self, action: &Action) -> DomainResult<()> {
        let (target_type, target_id) = match &action.target {
            Some(t) => (Some(t.entity_type.as_str()), Some(t.entity_id.as_str())),
            None => (None, None),
        };

        sqlx::query(
            r#"INSERT INTO actions (id, task_id, session_id, message_id, action_type, tool_name,
               target_type, target_id, status, requires_approval, approved_by, approved_at,
               rejection_reason, input, output, error_message, created_at, updated_at, executed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(action.id.to_string())
        .bind(action.task_id.to_string())
        .bind(&action.session_id)
        .bind(&action.message_id)
        .bind(&action.action_type)
        .bind(&action.tool_name)
        .bind(target_type)
        .bind(target_id)
        .bind(action.status.as_str())
        .bind(action.requires_approval)
        .bind(&action.approved_by)
        .bind(format_optional_datetime(action.approved_at))
        .bind(&action.rejection_reason)
        .bind(serde_json::to_string(&action.input)?)
        .bind(action.output.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&action.error_message)
        .bind(format_datetime(action.created_at))
        .bind(format_datetime(action.updated_at))
        .bind(format_optional_datetime(action.executed_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Action>> {
        let row: Option<ActionRow> = sqlx::query_as("SELECT * FROM actions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Action::try_from).transpose()
    }

    async fn update_if_status(&self, action: &Action, expected: ActionStatus) -> DomainResult<bool> {
        // Identity columns (task, tool, target, input) are immutable.
        let result = sqlx::query(
            r#"UPDATE actions SET status = ?, approved_by = ?, approved_at = ?,
               rejection_reason = ?, output = ?, error_message = ?, updated_at = ?, executed_at = ?
               WHERE id = ? AND status = ?"#,
        )
        .bind(action.status.as_str())
        .bind(&action.approved_by)
        .bind(format_optional_datetime(action.approved_at))
        .bind(&action.rejection_reason)
        .bind(action.output.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&action.error_message)
        .bind(format_datetime(action.updated_at))
        .bind(format_optional_datetime(action.executed_at))
        .bind(action.id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_decision(&self, action: &Action) -> DomainResult<bool> {
        let result = sqlx::query(
            r#"UPDATE actions SET status = ?, approved_by = ?, approved_at = ?,
               rejection_reason = ?, error_message = ?, updated_at = ?
               WHERE id = ? AND status = 'pending' AND requires_approval = 1
                 AND approved_at IS NULL AND rejection_reason IS NULL"#,
        )
        .bind(action.status.as_str())
        .bind(&action.approved_by)
        .bind(format_optional_datetime(action.approved_at))
        .bind(&action.rejection_reason)
        .bind(&action.error_message)
        .bind(format_datetime(action.updated_at))
        .bind(action.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, filter: ActionFilter) -> DomainResult<Vec<Action>> {
        let mut query = String::from("SELECT * FROM actions WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if let Some(task_id) = &filter.task_id {
            query.push_str(" AND task_id = ?");
            bindings.push(task_id.to_string());
        }
        if let Some(status) = &filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.as_str().to_string());
        }
        if filter.awaiting_approval {
            query.push_str(
                " AND status = 'pending' AND requires_approval = 1
                  AND approved_at IS NULL AND rejection_reason IS NULL",
            );
        }

        query.push_str(" ORDER BY created_at ASC, rowid ASC");
        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {}", limit.max(0)));
        }

        let mut q = sqlx::query_as::<_, ActionRow>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }

        let rows: Vec<ActionRow> = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(Action::try_from).collect()
    }

    async fn latest_for(
        &self,
        task_id: Uuid,
        tool_name: &str,
        target: Option<&EntityRef>,
    ) -> DomainResult<Option<Action>> {
        let row: Option<ActionRow> = sqlx::query_as(
            r#"SELECT * FROM actions
               WHERE task_id = ? AND tool_name = ? AND target_type IS ? AND target_id IS ?
               ORDER BY created_at DESC, rowid DESC
               LIMIT 1"#,
        )
        .bind(task_id.to_string())
        .bind(tool_name)
        .bind(target.map(|t| t.entity_type.as_str()))
        .bind(target.map(|t| t.entity_id.as_str()))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Action::try_from).transpose()
    }

    async fn fail_pending_for_task(
        &self,
        task_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<u64> {
        let result = sqlx::query(
            r#"UPDATE actions SET status = 'failed', error_message = ?, updated_at = ?
               WHERE task_id = ? AND status = 'pending'"#,
        )
        .bind(reason)
        .bind(format_datetime(now))
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn fail_pending_for_terminal_tasks(&self, reason: &str, now: DateTime<Utc>) -> DomainResult<u64> {
        let result = sqlx::query(
            r#"UPDATE actions SET status = 'failed', error_message = ?, updated_at = ?
               WHERE status = 'pending' AND task_id IN (
                   SELECT id FROM tasks WHERE status IN ('completed', 'failed', 'cancelled')
               )"#,
        )
        .bind(reason)
        .bind(format_datetime(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct ActionRow {
    id: String,
    task_id: String,
    session_id: Option<String>,
    message_id: Option<String>,
    action_type: String,
    tool_name: String,
    target_type: Option<String>,
    target_id: Option<String>,
    status: String,
    requires_approval: bool,
    approved_by: Option<String>,
    approved_at: Option<String>,
    rejection_reason: Option<String>,
    input: String,
    output: Option<String>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
    executed_at: Option<String>,
}

impl TryFrom<ActionRow> for Action {
    type Error = DomainError;

    fn try_from(row: ActionRow) -> Result<Self, Self::Error> {
        let status = ActionStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid action status: {}", row.status)))?;

        let target = match (row.target_type, row.target_id) {
            (Some(entity_type), Some(entity_id)) => Some(EntityRef { entity_type, entity_id }),
            _ => None,
        };

        Ok(Action {
            id: parse_uuid(&row.id)?,
            task_id: parse_uuid(&row.task_id)?,
            session_id: row.session_id,
            message_id: row.message_id,
            action_type: row.action_type,
            tool_name: row.tool_name,
            target,
            status,
            requires_approval: row.requires_approval,
            approved_by: row.approved_by,
            approved_at: parse_optional_datetime(row.approved_at)?,
            rejection_reason: row.rejection_reason,
            input: serde_json::from_str(&row.input)?,
            output: parse_optional_json(row.output)?,
            error_message: row.error_message,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
            executed_at: parse_optional_datetime(row.executed_at)?,
        })
    }
}
