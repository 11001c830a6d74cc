use std::sync::Arc;

use chrono::{NaiveTime, Weekday};
use sqlx::SqlitePool;
use tempfile::TempDir;

use foreman::adapters::sqlite::{
    create_migrated_test_pool, initialize_database, PoolConfig, SqliteActionRepository, SqliteTaskRepository,
    SqliteTenantConfigRepository,
};
use foreman::domain::models::{AutonomyLevel, TenantConfig};
use foreman::domain::ports::TenantConfigRepository;
use foreman::services::{RetryPolicy, TaskService, ToolRegistry};

pub type TestService = TaskService<SqliteTaskRepository, SqliteActionRepository, SqliteTenantConfigRepository>;

/// Create an in-memory SQLite database with migrations applied.
///
/// Each call creates a completely isolated database instance.
pub async fn setup_test_db() -> SqlitePool {
    create_migrated_test_pool().await.expect("failed to create test database")
}

/// Close the pool at the end of a test.
pub async fn teardown_test_db(pool: SqlitePool) {
    pool.close().await;
}

/// A migrated database file that several pools can open, standing in for
/// separate dispatcher processes.
pub struct FileDatabase {
    _dir: TempDir,
    pub url: String,
}

impl FileDatabase {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let url = format!("sqlite:{}", dir.path().join("foreman.db").display());
        let pool = initialize_database(&url, Some(PoolConfig::with_max_connections(1)))
            .await
            .expect("failed to initialize database");
        pool.close().await;
        Self { _dir: dir, url }
    }

    /// Open an independent pool on the shared file.
    pub async fn connect(&self, max_connections: u32) -> SqlitePool {
        initialize_database(&self.url, Some(PoolConfig::with_max_connections(max_connections)))
            .await
            .expect("failed to open database")
    }
}

/// Repositories and services over one pool.
pub struct Stack {
    pub pool: SqlitePool,
    pub task_repo: Arc<SqliteTaskRepository>,
    pub action_repo: Arc<SqliteActionRepository>,
    pub config_repo: Arc<SqliteTenantConfigRepository>,
    pub tasks: Arc<TestService>,
}

impl Stack {
    pub fn new(pool: SqlitePool, registry: ToolRegistry) -> Self {
        Self::with_retry_policy(pool, registry, RetryPolicy::default())
    }

    pub fn with_retry_policy(pool: SqlitePool, registry: ToolRegistry, policy: RetryPolicy) -> Self {
        let task_repo = Arc::new(SqliteTaskRepository::new(pool.clone()));
        let action_repo = Arc::new(SqliteActionRepository::new(pool.clone()));
        let config_repo = Arc::new(SqliteTenantConfigRepository::new(pool.clone()));
        let tasks = Arc::new(
            TaskService::new(task_repo.clone(), action_repo.clone(), config_repo.clone(), Arc::new(registry))
                .with_retry_policy(policy),
        );
        Self {
            pool,
            task_repo,
            action_repo,
            config_repo,
            tasks,
        }
    }

    pub async fn configure(&self, tenant: &TenantConfig) {
        self.config_repo.upsert(tenant).await.expect("failed to store tenant config");
    }
}

/// A tenant that may run anything, any time, with the given features.
pub fn open_tenant(tenant_id: &str, features: &[&str]) -> TenantConfig {
    let mut tenant = TenantConfig::new(tenant_id);
    tenant.autonomy_level = AutonomyLevel::Autonomous;
    tenant.working_hours_start = NaiveTime::MIN;
    tenant.working_hours_end = NaiveTime::from_hms_opt(23, 59, 59).expect("valid time");
    tenant.working_days = vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];
    for feature in features {
        tenant.enabled_features.insert((*feature).to_string());
    }
    tenant
}
