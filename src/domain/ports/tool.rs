//! Boundary between the scheduler and the tools that do the actual work.
//!
//! The scheduler knows nothing about tool internals. It hands a handler the
//! claimed task's payload and a cancellation token, and gets back either an
//! output or a classified failure.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::models::{EntityRef, TaskMetrics};

/// Everything a tool sees about the invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Task being executed
    pub task_id: Uuid,
    /// Ledger entry recorded for this invocation
    pub action_id: Uuid,
    /// Owning tenant
    pub tenant_id: String,
    /// Entity the task acts on, if any
    pub target: Option<EntityRef>,
    /// Task payload
    pub input: serde_json::Value,
    /// Fired when cancellation is requested or the claim is lost.
    /// Tools check it at their own safe points.
    pub cancellation: CancellationToken,
}

/// A successful invocation's result.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Stored as the task's output
    pub output: serde_json::Value,
    /// Usage merged into the task's metrics
    pub metrics: TaskMetrics,
}

impl ToolOutput {
    /// Output with empty metrics.
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            metrics: TaskMetrics::default(),
        }
    }

    /// Attach usage metrics.
    pub fn with_metrics(mut self, metrics: TaskMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Why an invocation did not produce output.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    /// The tool failed. `retryable` overrides the registry's default
    /// classification when the tool knows better.
    #[error("{message}")]
    Failed {
        /// Recorded as the task's error message
        message: String,
        /// Structured context, recorded as error details
        details: Option<serde_json::Value>,
        /// `None` defers to the registry
        retryable: Option<bool>,
    },

    /// The tool stopped early because its cancellation token fired.
    #[error("tool stopped after cancellation")]
    Cancelled,
}

impl ToolError {
    /// Failure classified by the registry default.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            details: None,
            retryable: None,
        }
    }

    /// Failure that should be retried.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            details: None,
            retryable: Some(true),
        }
    }

    /// Failure that must not be retried.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            details: None,
            retryable: Some(false),
        }
    }
}

/// A registered unit of work.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool for the action in `ctx`.
    async fn invoke(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError>;
}
