//! Registry mapping task types to the tools that execute them.
//!
//! The scheduler reaches tools only through this indirection. Each entry
//! carries the tool's input schema, its approval flag, its error
//! classification, and what a rejected approval means for the task.

use jsonschema::{Draft, JSONSchema};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::{ToolError, ToolHandler};

/// How a task is resolved when an approver rejects one of its actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectionPolicy {
    /// The task fails with the rejection as its error.
    #[default]
    FailTask,
    /// The task ends as cancelled; the rejection is not treated as an error.
    CancelTask,
}

/// One registry entry: a task type and how to run it.
#[derive(Clone)]
pub struct ToolDefinition {
    /// Task type this tool executes
    pub name: String,
    /// Tenant feature key that must be enabled to create tasks of this type
    pub feature: String,
    /// Invocations wait for human approval at every autonomy level
    pub requires_approval: bool,
    /// Background tools only run inside the tenant's working hours
    pub background: bool,
    /// Classification for failures the tool does not classify itself
    pub retryable_by_default: bool,
    /// What a rejected approval does to the task
    pub on_rejection: RejectionPolicy,
    /// Schema the task input must satisfy, as configured
    pub input_schema: Option<serde_json::Value>,
    validator: Option<Arc<JSONSchema>>,
    /// Code that runs the tool
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("feature", &self.feature)
            .field("requires_approval", &self.requires_approval)
            .field("background", &self.background)
            .field("retryable_by_default", &self.retryable_by_default)
            .field("on_rejection", &self.on_rejection)
            .finish_non_exhaustive()
    }
}

impl ToolDefinition {
    /// Ungated, foreground, retryable by default, failing the task on rejection.
    pub fn new(name: impl Into<String>, feature: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            name: name.into(),
            feature: feature.into(),
            requires_approval: false,
            background: false,
            retryable_by_default: true,
            on_rejection: RejectionPolicy::default(),
            input_schema: None,
            validator: None,
            handler,
        }
    }

    /// Set the approval flag.
    pub fn with_approval_required(mut self, required: bool) -> Self {
        self.requires_approval = required;
        self
    }

    /// Only run inside tenant working hours.
    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Set how unclassified failures are treated.
    pub fn with_retryable_by_default(mut self, retryable: bool) -> Self {
        self.retryable_by_default = retryable;
        self
    }

    /// Set what a rejection does to the task.
    pub fn on_rejection(mut self, policy: RejectionPolicy) -> Self {
        self.on_rejection = policy;
        self
    }

    /// Attach a Draft 7 JSON schema that task payloads must satisfy.
    pub fn with_input_schema(mut self, schema: serde_json::Value) -> DomainResult<Self> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema)
            .map_err(|e| {
                DomainError::Validation(format!("Invalid input schema for tool {}: {e}", self.name))
            })?;
        self.validator = Some(Arc::new(compiled));
        self.input_schema = Some(schema);
        Ok(self)
    }

    /// Check a payload against the tool's input schema, if it has one.
    pub fn validate_input(&self, input: &serde_json::Value) -> DomainResult<()> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };

        if let Err(errors) = validator.validate(input) {
            let messages: Vec<String> = errors
                .map(|e| format!("{} at {}", e, e.instance_path))
                .collect();
            return Err(DomainError::Validation(format!(
                "Payload for {} does not match its schema: {}",
                self.name,
                messages.join("; ")
            )));
        }
        Ok(())
    }

    /// Whether a failure should be retried. The tool's own hint wins.
    pub fn is_retryable(&self, error: &ToolError) -> bool {
        match error {
            ToolError::Failed { retryable: Some(hint), .. } => *hint,
            ToolError::Failed { retryable: None, .. } | ToolError::Cancelled => self.retryable_by_default,
        }
    }
}

/// Task types and the tools that serve them.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDefinition>,
}

impl ToolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names are unique.
    pub fn register(&mut self, tool: ToolDefinition) -> DomainResult<()> {
        if tool.name.trim().is_empty() {
            return Err(DomainError::Validation("Tool name cannot be empty".to_string()));
        }
        if self.tools.contains_key(&tool.name) {
            return Err(DomainError::Validation(format!("Tool already registered: {}", tool.name)));
        }
        self.tools.insert(tool.name.clone(), tool);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_tool(mut self, tool: ToolDefinition) -> DomainResult<Self> {
        self.register(tool)?;
        Ok(self)
    }

    /// Tool registered under `name`.
    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// Look up a tool for a task type, failing validation if unknown.
    pub fn resolve(&self, task_type: &str) -> DomainResult<&ToolDefinition> {
        self.get(task_type)
            .ok_or_else(|| DomainError::Validation(format!("Unknown task type: {task_type}")))
    }

    /// Names of background tools, for exclusion outside working hours.
    pub fn background_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .values()
            .filter(|t| t.background)
            .map(|t| t.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ToolContext, ToolOutput};
    use async_trait::async_trait;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl ToolHandler for Noop {
        async fn invoke(&self, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::default())
        }
    }

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition::new(name, "document_processing", Arc::new(Noop))
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(tool("classify")).unwrap();
        assert!(registry.register(tool("classify")).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_schema_validation() {
        let def = tool("classify")
            .with_input_schema(json!({
                "type": "object",
                "required": ["document_id"],
                "properties": {"document_id": {"type": "string"}}
            }))
            .unwrap();

        assert!(def.validate_input(&json!({"document_id": "d-1"})).is_ok());
        let err = def.validate_input(&json!({"document_id": 7})).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(def.validate_input(&json!({})).is_err());
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let result = tool("classify").with_input_schema(json!({"type": "not-a-type"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_error_classification() {
        let def = tool("classify").with_retryable_by_default(false);
        assert!(!def.is_retryable(&ToolError::failed("boom")));
        assert!(def.is_retryable(&ToolError::transient("timeout")));

        let def = tool("classify");
        assert!(def.is_retryable(&ToolError::failed("boom")));
        assert!(!def.is_retryable(&ToolError::permanent("bad input")));
    }

    #[test]
    fn test_background_tools_listed() {
        let registry = ToolRegistry::new()
            .with_tool(tool("nightly_digest").background())
            .unwrap()
            .with_tool(tool("classify"))
            .unwrap();
        assert_eq!(registry.background_tools(), vec!["nightly_digest".to_string()]);
        assert!(registry.resolve("missing").is_err());
    }
}
