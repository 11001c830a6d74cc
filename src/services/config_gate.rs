//! Admission and scheduling-window checks driven by tenant configuration.
//!
//! Creation-time checks reject work synchronously. Claim-time checks never
//! fail a task; they only narrow what a dispatch cycle may claim.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AutonomyLevel, QuotaWindow, Task, TenantConfig};
use crate::domain::ports::{TaskRepository, TenantConfigRepository};
use crate::services::tool_registry::ToolRegistry;

/// Immutable view of every tenant's configuration, read once per dispatch
/// cycle. Administrative changes take effect on the next cycle.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    configs: HashMap<String, TenantConfig>,
    taken_at: Option<DateTime<Utc>>,
}

impl ConfigSnapshot {
    /// Read every tenant's configuration once.
    pub async fn load<C: TenantConfigRepository + ?Sized>(repo: &C) -> DomainResult<Self> {
        let configs = repo
            .list()
            .await?
            .into_iter()
            .map(|c| (c.tenant_id.clone(), c))
            .collect();
        Ok(Self {
            configs,
            taken_at: Some(Utc::now()),
        })
    }

    /// Snapshot over configurations already in hand.
    pub fn from_configs(configs: impl IntoIterator<Item = TenantConfig>) -> Self {
        Self {
            configs: configs.into_iter().map(|c| (c.tenant_id.clone(), c)).collect(),
            taken_at: Some(Utc::now()),
        }
    }

    /// Configuration for `tenant_id`, if it has one.
    pub fn get(&self, tenant_id: &str) -> Option<&TenantConfig> {
        self.configs.get(tenant_id)
    }

    /// Tenants that accept background work, in a stable order.
    pub fn active_tenants(&self) -> Vec<&TenantConfig> {
        let mut tenants: Vec<&TenantConfig> = self
            .configs
            .values()
            .filter(|c| c.autonomy_level != AutonomyLevel::Disabled)
            .collect();
        tenants.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        tenants
    }

    /// When the snapshot was read.
    pub fn taken_at(&self) -> Option<DateTime<Utc>> {
        self.taken_at
    }

    /// Number of configured tenants.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Whether no tenant is configured.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

/// Creation-time admission: type, autonomy, feature, schema and quotas.
pub struct ConfigGate<T: TaskRepository, C: TenantConfigRepository> {
    task_repo: Arc<T>,
    config_repo: Arc<C>,
    registry: Arc<ToolRegistry>,
}

impl<T: TaskRepository, C: TenantConfigRepository> ConfigGate<T, C> {
    /// Gate over the given stores and registry.
    pub fn new(task_repo: Arc<T>, config_repo: Arc<C>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            task_repo,
            config_repo,
            registry,
        }
    }

    /// Creation-time admission. Returns the tenant configuration it checked.
    pub async fn admit(&self, task: &Task, now: DateTime<Utc>) -> DomainResult<TenantConfig> {
        let tool = self.registry.resolve(&task.task_type)?;

        let config = self
            .config_repo
            .get(&task.tenant_id)
            .await?
            .ok_or_else(|| DomainError::TenantNotFound(task.tenant_id.clone()))?;

        if config.autonomy_level == AutonomyLevel::Disabled {
            return Err(DomainError::Validation(format!(
                "Background tasks are disabled for tenant {}",
                task.tenant_id
            )));
        }
        if !config.is_feature_enabled(&tool.feature) {
            return Err(DomainError::Validation(format!(
                "Feature {} is not enabled for tenant {}",
                tool.feature, task.tenant_id
            )));
        }

        tool.validate_input(&task.input)?;

        for window in [QuotaWindow::Daily, QuotaWindow::Monthly] {
            let Some(limit) = config.quota_limit(window) else {
                continue;
            };
            let since = config.quota_window_start(window, now);
            let used = self.task_repo.count_created_since(&task.tenant_id, since).await?;
            if used >= u64::from(limit) {
                return Err(DomainError::QuotaExceeded {
                    tenant_id: task.tenant_id.clone(),
                    window: window.as_str().to_string(),
                    limit,
                });
            }
        }

        Ok(config)
    }

    /// Task types a cycle must leave unclaimed for this tenant at `now`.
    pub fn excluded_task_types(&self, config: &TenantConfig, now: DateTime<Utc>) -> Vec<String> {
        if config.is_within_working_hours(now) {
            return Vec::new();
        }
        let excluded = self.registry.background_tools();
        if !excluded.is_empty() {
            debug!(tenant_id = %config.tenant_id, excluded = ?excluded, "Outside working hours, holding background tools");
        }
        excluded
    }

    /// How many tasks this tenant may claim now, given `max_concurrent_tasks`.
    pub async fn claim_budget(&self, config: &TenantConfig, batch_size: usize) -> DomainResult<usize> {
        let Some(max_concurrent) = config.max_concurrent_tasks else {
            return Ok(batch_size);
        };
        let running = self.task_repo.count_running(&config.tenant_id).await?;
        let headroom = u64::from(max_concurrent).saturating_sub(running);
        Ok(batch_size.min(headroom as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteTaskRepository, SqliteTenantConfigRepository};
    use crate::domain::ports::{ClaimRequest, ToolContext, ToolError, ToolHandler, ToolOutput};
    use crate::services::tool_registry::ToolDefinition;
    use async_trait::async_trait;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl ToolHandler for Noop {
        async fn invoke(&self, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::default())
        }
    }

    type Gate = ConfigGate<SqliteTaskRepository, SqliteTenantConfigRepository>;

    async fn setup() -> (Gate, Arc<SqliteTaskRepository>, Arc<SqliteTenantConfigRepository>) {
        let pool = create_migrated_test_pool().await.unwrap();
        let tasks = Arc::new(SqliteTaskRepository::new(pool.clone()));
        let configs = Arc::new(SqliteTenantConfigRepository::new(pool));
        let registry = ToolRegistry::new()
            .with_tool(
                ToolDefinition::new("classify", "document_processing", Arc::new(Noop))
                    .with_input_schema(json!({"type": "object", "required": ["document_id"]}))
                    .unwrap(),
            )
            .unwrap()
            .with_tool(ToolDefinition::new("nightly_digest", "reports", Arc::new(Noop)).background())
            .unwrap();
        let gate = ConfigGate::new(tasks.clone(), configs.clone(), Arc::new(registry));
        (gate, tasks, configs)
    }

    fn classify_task() -> Task {
        Task::new("acme", "classify", json!({"document_id": "d-1"}))
    }

    #[tokio::test]
    async fn test_admits_enabled_feature() {
        let (gate, _, configs) = setup().await;
        configs.upsert(&TenantConfig::new("acme").with_feature("document_processing")).await.unwrap();
        assert!(gate.admit(&classify_task(), Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_disabled_feature_unknown_type_and_bad_payload() {
        let (gate, _, configs) = setup().await;
        configs.upsert(&TenantConfig::new("acme").with_feature("reports")).await.unwrap();

        let err = gate.admit(&classify_task(), Utc::now()).await.unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let unknown = Task::new("acme", "teleport", json!({}));
        assert!(matches!(gate.admit(&unknown, Utc::now()).await, Err(DomainError::Validation(_))));

        configs.upsert(&TenantConfig::new("acme").with_feature("document_processing")).await.unwrap();
        let bad = Task::new("acme", "classify", json!({"wrong": true}));
        assert!(matches!(gate.admit(&bad, Utc::now()).await, Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn test_rejects_disabled_autonomy_and_unknown_tenant() {
        let (gate, _, configs) = setup().await;
        assert!(matches!(
            gate.admit(&classify_task(), Utc::now()).await,
            Err(DomainError::TenantNotFound(_))
        ));

        let mut config = TenantConfig::new("acme").with_feature("document_processing");
        config.autonomy_level = AutonomyLevel::Disabled;
        configs.upsert(&config).await.unwrap();
        assert!(matches!(
            gate.admit(&classify_task(), Utc::now()).await,
            Err(DomainError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_daily_quota() {
        let (gate, tasks, configs) = setup().await;
        let mut config = TenantConfig::new("acme").with_feature("document_processing");
        config.daily_task_quota = Some(2);
        configs.upsert(&config).await.unwrap();

        for _ in 0..2 {
            tasks.create(&classify_task()).await.unwrap();
        }

        let err = gate.admit(&classify_task(), Utc::now()).await.unwrap_err();
        assert!(matches!(err, DomainError::QuotaExceeded { limit: 2, ref window, .. } if window == "daily"));
    }

    #[tokio::test]
    async fn test_claim_budget_respects_concurrency_cap() {
        let (gate, tasks, _) = setup().await;
        let mut config = TenantConfig::new("acme");
        assert_eq!(gate.claim_budget(&config, 10).await.unwrap(), 10);

        config.max_concurrent_tasks = Some(3);
        for _ in 0..2 {
            tasks.create(&classify_task()).await.unwrap();
        }
        tasks.claim(ClaimRequest::for_tenant("acme", 2)).await.unwrap();
        assert_eq!(gate.claim_budget(&config, 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_background_tools_excluded_outside_hours() {
        let (gate, _, _) = setup().await;
        let config = TenantConfig::new("acme");
        // Wednesday 12:00 UTC is inside the default window; 20:00 is not.
        let inside = DateTime::parse_from_rfc3339("2026-10-14T12:00:00Z").unwrap().with_timezone(&Utc);
        let outside = DateTime::parse_from_rfc3339("2026-10-14T20:00:00Z").unwrap().with_timezone(&Utc);

        assert!(gate.excluded_task_types(&config, inside).is_empty());
        assert_eq!(gate.excluded_task_types(&config, outside), vec!["nightly_digest".to_string()]);
    }

    #[test]
    fn test_snapshot_skips_disabled_tenants() {
        let mut disabled = TenantConfig::new("globex");
        disabled.autonomy_level = AutonomyLevel::Disabled;
        let snapshot = ConfigSnapshot::from_configs([TenantConfig::new("acme"), disabled]);

        let active: Vec<_> = snapshot.active_tenants().iter().map(|c| c.tenant_id.clone()).collect();
        assert_eq!(active, vec!["acme".to_string()]);
        assert!(snapshot.get("globex").is_some());
    }
}
