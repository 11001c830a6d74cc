//! Storage port for tenant configuration.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::TenantConfig;

/// Store for per-tenant configuration.
#[async_trait]
pub trait TenantConfigRepository: Send + Sync {
    /// Insert or replace a tenant's configuration.
    async fn upsert(&self, config: &TenantConfig) -> DomainResult<()>;

    /// Configuration for one tenant, if any.
    async fn get(&self, tenant_id: &str) -> DomainResult<Option<TenantConfig>>;

    /// Every tenant, ordered by id.
    async fn list(&self) -> DomainResult<Vec<TenantConfig>>;
}
