//! Tools backed by external commands, for the `foreman` binary.
//!
//! The task input goes to the child's stdin as JSON. A zero exit makes
//! stdout the output (parsed as JSON when it is JSON). Exit code 75
//! (`EX_TEMPFAIL`) marks a failure as retryable; any other non-zero exit
//! leaves classification to the tool's configuration. The child is killed
//! when the task is cancelled or the timeout expires.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::ToolConfig;
use crate::domain::ports::{ToolContext, ToolError, ToolHandler, ToolOutput};
use crate::services::tool_registry::{RejectionPolicy, ToolDefinition, ToolRegistry};

/// Exit status a command uses to ask for a retry.
pub const EXIT_TEMPFAIL: i32 = 75;

const STDERR_LIMIT: usize = 4096;

/// A tool that runs an external program per invocation.
#[derive(Debug, Clone)]
pub struct CommandTool {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandTool {
    /// `command` is the program followed by its arguments; it must not be empty.
    pub fn new(command: &[String], timeout: Duration) -> DomainResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| DomainError::Validation("Tool command cannot be empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    fn build_command(&self, ctx: &ToolContext) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("FOREMAN_TASK_ID", ctx.task_id.to_string())
            .env("FOREMAN_ACTION_ID", ctx.action_id.to_string())
            .env("FOREMAN_TENANT_ID", &ctx.tenant_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(target) = &ctx.target {
            cmd.env("FOREMAN_TARGET", target.to_string());
        }
        cmd
    }

    fn interpret(output: Output) -> Result<ToolOutput, ToolError> {
        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() {
            let trimmed = stdout.trim();
            let value = if trimmed.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
            };
            return Ok(ToolOutput::new(value));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let stderr = &stderr[..floor_char_boundary(stderr, STDERR_LIMIT)];
        let code = output.status.code();
        let message = match (code, stderr.lines().last()) {
            (Some(code), Some(line)) => format!("exited with status {code}: {line}"),
            (Some(code), None) => format!("exited with status {code}"),
            (None, _) => "terminated by signal".to_string(),
        };

        Err(ToolError::Failed {
            message,
            details: Some(json!({ "exit_code": code, "stderr": stderr })),
            retryable: (code == Some(EXIT_TEMPFAIL)).then_some(true),
        })
    }
}

#[async_trait]
impl ToolHandler for CommandTool {
    async fn invoke(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let payload = serde_json::to_vec(&ctx.input)
            .map_err(|e| ToolError::permanent(format!("Failed to encode input: {e}")))?;

        let mut child = self
            .build_command(&ctx)
            .spawn()
            .map_err(|e| ToolError::permanent(format!("Failed to spawn {}: {e}", self.program)))?;
        debug!(task_id = %ctx.task_id, program = %self.program, pid = ?child.id(), "Spawned tool command");

        // Input is fed while stdout is drained; a filter that echoes as it
        // reads would otherwise fill its stdout pipe and stall the write.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command that exits without reading its input closes the pipe early.
                if let Err(e) = stdin.write_all(&payload).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(e);
                    }
                }
            }
            Ok(())
        };
        let run = async { tokio::join!(feed, child.wait_with_output()) };

        // Dropping the child (timeout or cancellation) kills it.
        tokio::select! {
            result = tokio::time::timeout(self.timeout, run) => match result {
                Ok((Err(e), _)) => Err(ToolError::transient(format!("Failed to write input: {e}"))),
                Ok((Ok(()), Ok(output))) => Self::interpret(output),
                Ok((Ok(()), Err(e))) => {
                    Err(ToolError::transient(format!("Failed to wait for {}: {e}", self.program)))
                }
                Err(_) => Err(ToolError::transient(format!(
                    "{} timed out after {}s",
                    self.program,
                    self.timeout.as_secs()
                ))),
            },
            () = ctx.cancellation.cancelled() => Err(ToolError::Cancelled),
        }
    }
}

/// Build a registry from the `tools` configuration section.
pub fn registry_from_config(tools: &[ToolConfig]) -> DomainResult<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        let handler = Arc::new(CommandTool::new(&tool.command, tool.timeout())?);
        let mut definition = ToolDefinition::new(&tool.name, &tool.feature, handler)
            .with_approval_required(tool.requires_approval)
            .with_retryable_by_default(tool.retryable_by_default);
        if tool.background {
            definition = definition.background();
        }
        if tool.cancel_on_rejection {
            definition = definition.on_rejection(RejectionPolicy::CancelTask);
        }
        if let Some(schema) = &tool.input_schema {
            definition = definition.with_input_schema(schema.clone())?;
        }
        registry.register(definition)?;
    }
    Ok(registry)
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}
