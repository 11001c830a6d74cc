//! SQLite implementation of the TenantConfigRepository.

use async_trait::async_trait;
use chrono::{NaiveTime, Weekday};
use sqlx::SqlitePool;
use std::collections::BTreeSet;

use super::{format_datetime, parse_datetime};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AutonomyLevel, TenantConfig};
use crate::domain::ports::TenantConfigRepository;

const TIME_FORMAT: &str = "%H:%M:%S";

/// SQLite-backed tenant configuration store.
#[derive(Clone)]
pub struct SqliteTenantConfigRepository {
    pool: SqlitePool,
}

impl SqliteTenantConfigRepository {
    /// Wrap a pool that has already been migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantConfigRepository for SqliteTenantConfigRepository {
    async fn upsert(&self, config: &TenantConfig) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO tenant_configs (tenant_id, autonomy_level, enabled_features,
               daily_task_quota, monthly_task_quota, max_concurrent_tasks, working_hours_start,
               working_hours_end, working_days, timezone, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(tenant_id) DO UPDATE SET
                   autonomy_level = excluded.autonomy_level,
                   enabled_features = excluded.enabled_features,
                   daily_task_quota = excluded.daily_task_quota,
                   monthly_task_quota = excluded.monthly_task_quota,
                   max_concurrent_tasks = excluded.max_concurrent_tasks,
                   working_hours_start = excluded.working_hours_start,
                   working_hours_end = excluded.working_hours_end,
                   working_days = excluded.working_days,
                   timezone = excluded.timezone,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&config.tenant_id)
        .bind(config.autonomy_level.as_str())
        .bind(serde_json::to_string(&config.enabled_features)?)
        .bind(config.daily_task_quota.map(i64::from))
        .bind(config.monthly_task_quota.map(i64::from))
        .bind(config.max_concurrent_tasks.map(i64::from))
        .bind(config.working_hours_start.format(TIME_FORMAT).to_string())
        .bind(config.working_hours_end.format(TIME_FORMAT).to_string())
        .bind(serde_json::to_string(&config.working_days)?)
        .bind(&config.timezone)
        .bind(format_datetime(config.created_at))
        .bind(format_datetime(config.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, tenant_id: &str) -> DomainResult<Option<TenantConfig>> {
        let row: Option<TenantConfigRow> =
            sqlx::query_as("SELECT * FROM tenant_configs WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(TenantConfig::try_from).transpose()
    }

    async fn list(&self) -> DomainResult<Vec<TenantConfig>> {
        let rows: Vec<TenantConfigRow> =
            sqlx::query_as("SELECT * FROM tenant_configs ORDER BY tenant_id")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(TenantConfig::try_from).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TenantConfigRow {
    tenant_id: String,
    autonomy_level: String,
    enabled_features: String,
    daily_task_quota: Option<i64>,
    monthly_task_quota: Option<i64>,
    max_concurrent_tasks: Option<i64>,
    working_hours_start: String,
    working_hours_end: String,
    working_days: String,
    timezone: String,
    created_at: String,
    updated_at: String,
}

fn parse_time(s: &str) -> DomainResult<NaiveTime> {
    NaiveTime::parse_from_str(s, TIME_FORMAT)
        .map_err(|e| DomainError::SerializationError(format!("Invalid time {s}: {e}")))
}

impl TryFrom<TenantConfigRow> for TenantConfig {
    type Error = DomainError;

    fn try_from(row: TenantConfigRow) -> Result<Self, Self::Error> {
        let autonomy_level = AutonomyLevel::from_str(&row.autonomy_level).ok_or_else(|| {
            DomainError::SerializationError(format!("Invalid autonomy level: {}", row.autonomy_level))
        })?;
        let enabled_features: BTreeSet<String> = serde_json::from_str(&row.enabled_features)?;
        let working_days: Vec<Weekday> = serde_json::from_str(&row.working_days)?;

        Ok(TenantConfig {
            tenant_id: row.tenant_id,
            autonomy_level,
            enabled_features,
            daily_task_quota: row.daily_task_quota.map(|v| v as u32),
            monthly_task_quota: row.monthly_task_quota.map(|v| v as u32),
            max_concurrent_tasks: row.max_concurrent_tasks.map(|v| v as u32),
            working_hours_start: parse_time(&row.working_hours_start)?,
            working_hours_end: parse_time(&row.working_hours_end)?,
            working_days,
            timezone: row.timezone,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}
