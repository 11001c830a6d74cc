//! Wiring shared by every command that touches the database.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::adapters::sqlite::{
    initialize_database, PoolConfig, SqliteActionRepository, SqliteTaskRepository,
    SqliteTenantConfigRepository,
};
use crate::domain::models::Config;
use crate::services::{
    registry_from_config, Dispatcher, ReconciliationSweep, RetryPolicy, TaskService,
};

/// Task service over the SQLite adapters.
pub type AppTaskService = TaskService<SqliteTaskRepository, SqliteActionRepository, SqliteTenantConfigRepository>;
/// Dispatcher over the SQLite adapters.
pub type AppDispatcher = Dispatcher<SqliteTaskRepository, SqliteActionRepository, SqliteTenantConfigRepository>;
/// Reconciliation sweep over the SQLite adapters.
pub type AppSweep = ReconciliationSweep<SqliteTaskRepository, SqliteActionRepository, SqliteTenantConfigRepository>;

/// Everything a command needs, built from one configuration.
pub struct AppContext {
    /// Effective configuration.
    pub config: Config,
    /// Open database pool.
    pub pool: SqlitePool,
    /// Task store, for commands that claim directly.
    pub task_repo: Arc<SqliteTaskRepository>,
    /// Tenant configuration store.
    pub config_repo: Arc<SqliteTenantConfigRepository>,
    /// Task lifecycle service.
    pub tasks: Arc<AppTaskService>,
}

impl AppContext {
    /// Open the configured database and build the services on top of it.
    pub async fn open(config: Config) -> Result<Self> {
        let registry = registry_from_config(&config.tools).context("Invalid tools configuration")?;
        let pool = initialize_database(
            &config.database.url(),
            Some(PoolConfig::with_max_connections(config.database.max_connections)),
        )
        .await
        .context("Failed to open database. Run 'foreman init' first.")?;

        Ok(Self::from_pool(config, pool, registry))
    }

    /// Build the services on an already-migrated pool.
    pub fn from_pool(config: Config, pool: SqlitePool, registry: crate::services::ToolRegistry) -> Self {
        let task_repo = Arc::new(SqliteTaskRepository::new(pool.clone()));
        let action_repo = Arc::new(SqliteActionRepository::new(pool.clone()));
        let config_repo = Arc::new(SqliteTenantConfigRepository::new(pool.clone()));
        let tasks = Arc::new(
            TaskService::new(task_repo.clone(), action_repo, config_repo.clone(), Arc::new(registry))
                .with_retry_policy(RetryPolicy::from(&config.retry)),
        );

        Self {
            config,
            pool,
            task_repo,
            config_repo,
            tasks,
        }
    }

    /// Dispatcher built from the `dispatcher` section.
    pub fn dispatcher(&self) -> AppDispatcher {
        Dispatcher::new(
            self.tasks.clone(),
            self.task_repo.clone(),
            self.config_repo.clone(),
            self.config.dispatcher.clone(),
        )
    }

    /// Sweep built from the `reconciliation` section.
    pub fn sweep(&self) -> AppSweep {
        ReconciliationSweep::new(self.tasks.clone(), self.task_repo.clone(), self.config.reconciliation.clone())
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
