//! Domain errors for the Foreman scheduler.

use thiserror::Error;
use uuid::Uuid;

/// Domain-level errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Bad input, unknown task type, or a disabled feature. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A failure expected to clear on retry.
    #[error("Transient error: {0}")]
    Transient(String),

    /// An approver rejected a gated action.
    #[error("Action {action_id} rejected: {reason}")]
    ApprovalRejected {
        /// The rejected action
        action_id: Uuid,
        /// Reason given by the approver
        reason: String,
    },

    /// Creating the task would exceed a tenant quota.
    #[error("Quota exceeded for tenant {tenant_id}: {window} limit of {limit} reached")]
    QuotaExceeded {
        /// Tenant whose quota is full
        tenant_id: String,
        /// `daily` or `monthly`
        window: String,
        /// Configured limit for the window
        limit: u32,
    },

    /// The worker's claim was taken away, typically by the reconciliation sweep.
    #[error("Claim on task {task_id} is no longer held by this worker")]
    StaleClaim {
        /// Task whose claim was lost
        task_id: Uuid,
    },

    /// The requested transition is not valid from the current state.
    #[error("Invalid state for {entity} {id}: {reason}")]
    InvalidState {
        /// `task` or `action`
        entity: &'static str,
        /// Id of the entity
        id: Uuid,
        /// Why the transition was refused
        reason: String,
    },

    /// A versioned write lost to a concurrent writer.
    #[error("Concurrency conflict: {entity} {id} was modified")]
    ConcurrencyConflict {
        /// `task` or `action`
        entity: &'static str,
        /// Id of the entity
        id: Uuid,
    },

    /// No task with this id.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// No action with this id.
    #[error("Action not found: {0}")]
    ActionNotFound(Uuid),

    /// The tenant has no configuration row.
    #[error("Tenant not configured: {0}")]
    TenantNotFound(String),

    /// Storage failure.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A stored value could not be decoded.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Whether a caller may reasonably try the same operation again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::DatabaseError(_))
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}
