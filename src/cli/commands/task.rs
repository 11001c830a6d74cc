//! Task CLI commands.
//!
//! `claim`, `heartbeat`, `complete` and `fail` let an external worker drive
//! tasks through the same protocol the built-in dispatcher uses.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use uuid::Uuid;

use crate::cli::commands::action::ActionOutput;
use crate::cli::context::AppContext;
use crate::cli::output::{format_time, list_table, output, short_id, truncate, CommandOutput};
use crate::domain::models::{Config, EntityRef, Task, TaskMetrics, TaskStatus};
use crate::domain::ports::{ActionFilter, ClaimRequest, Heartbeat, TaskFilter, TaskRepository, TenantConfigRepository};
use crate::services::{FailureReport, NewTask};

/// Arguments for `foreman task`.
#[derive(Args, Debug)]
pub struct TaskArgs {
    /// Task subcommand to run.
    #[command(subcommand)]
    pub command: TaskCommands,
}

/// Subcommands of `foreman task`.
#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Submit a new task
    Create(TaskCreateArgs),
    /// Show task details and its actions
    Show {
        /// Task ID
        id: Uuid,
    },
    /// List tasks
    List {
        /// Filter by tenant
        #[arg(short, long)]
        tenant: Option<String>,
        /// Filter by status (pending, scheduled, running, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,
        /// Filter by task type
        #[arg(long = "type")]
        task_type: Option<String>,
        /// Maximum number of tasks to display
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
    /// Count tasks per status
    Stats {
        /// Restrict to one tenant
        #[arg(short, long)]
        tenant: Option<String>,
    },
    /// Cancel a task. Running tasks stop at their next heartbeat.
    Cancel {
        /// Task ID
        id: Uuid,
    },
    /// Report a task as completed
    Complete {
        /// Task ID
        id: Uuid,
        /// Claim token from `task claim`; omit for an administrative report
        #[arg(long)]
        claim_token: Option<Uuid>,
        /// Output as JSON
        #[arg(long, default_value = "null")]
        output: String,
        /// Model tokens consumed
        #[arg(long)]
        tokens_used: Option<u64>,
        /// Spend attributed to the task, in USD
        #[arg(long)]
        cost_usd: Option<f64>,
    },
    /// Report a task as failed
    Fail {
        /// Task ID
        id: Uuid,
        /// Claim token from `task claim`; omit for an administrative report
        #[arg(long)]
        claim_token: Option<Uuid>,
        /// Error message
        #[arg(short, long)]
        message: String,
        /// Error details as JSON
        #[arg(long)]
        details: Option<String>,
        /// Fail terminally without spending retries
        #[arg(long)]
        permanent: bool,
    },
    /// Claim due tasks for an external worker
    Claim {
        /// Only claim this tenant's tasks
        #[arg(short, long)]
        tenant: Option<String>,
        /// Maximum tasks to claim
        #[arg(short, long, default_value = "1")]
        limit: usize,
    },
    /// Record liveness for a claimed task
    Heartbeat {
        /// Task ID
        id: Uuid,
        /// Claim token from `task claim`
        #[arg(long)]
        claim_token: Uuid,
    },
}

/// Arguments for `foreman task create`.
#[derive(Args, Debug)]
pub struct TaskCreateArgs {
    /// Tenant ID
    #[arg(short, long)]
    pub tenant: String,

    /// Task type (a registered tool name)
    #[arg(long = "type")]
    pub task_type: String,

    /// Input as JSON
    #[arg(short, long, conflicts_with = "input_file")]
    pub input: Option<String>,

    /// Read input JSON from a file
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// Priority (0-100, lower = more urgent, default 50)
    #[arg(short, long)]
    pub priority: Option<i32>,

    /// Entity the task acts on, as type:id
    #[arg(long)]
    pub target: Option<String>,

    /// Earliest start as RFC3339
    #[arg(long, conflicts_with = "delay_secs")]
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Earliest start as seconds from now
    #[arg(long)]
    pub delay_secs: Option<i64>,

    /// Retry budget (defaults to the configured max_retries)
    #[arg(long)]
    pub max_retries: Option<u32>,
}

/// One task as printed by the CLI.
#[derive(Debug, serde::Serialize)]
pub struct TaskOutput {
    /// Task id
    pub id: String,
    /// Owning tenant
    pub tenant_id: String,
    /// Registry key of the tool
    pub task_type: String,
    /// Current status
    pub status: String,
    /// Lower runs first
    pub priority: i32,
    /// Target entity as `type:id`
    pub target: Option<String>,
    /// Tool input
    pub input: Value,
    /// Tool output, once completed
    pub output: Option<Value>,
    /// Failures retried so far
    pub retry_count: u32,
    /// Retry budget
    pub max_retries: u32,
    /// Earliest start, if delayed
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Earliest retry, after a failure
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Start of the current or last claim
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure message
    pub error_message: Option<String>,
    /// Last failure details
    pub error_details: Option<Value>,
    /// Current claim token, while running
    pub claim_token: Option<String>,
    /// Whether cancellation was requested while running
    pub cancel_requested: bool,
    /// Usage reported by the tool
    pub metrics: TaskMetrics,
    /// When the task was created
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for TaskOutput {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            tenant_id: task.tenant_id.clone(),
            task_type: task.task_type.clone(),
            status: task.status.as_str().to_string(),
            priority: task.priority,
            target: task.target.as_ref().map(ToString::to_string),
            input: task.input.clone(),
            output: task.output.clone(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            scheduled_for: task.scheduled_for,
            next_retry_at: task.next_retry_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            error_message: task.error_message.clone(),
            error_details: task.error_details.clone(),
            claim_token: task.claim_token.map(|t| t.to_string()),
            cancel_requested: task.cancel_requested_at.is_some(),
            metrics: task.metrics.clone(),
            created_at: task.created_at,
        }
    }
}

impl CommandOutput for TaskOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![
            format!("Task: {}", self.id),
            format!("Tenant: {}", self.tenant_id),
            format!("Type: {}", self.task_type),
            format!("Status: {}", self.status),
            format!("Priority: {}", self.priority),
            format!("Retries: {}/{}", self.retry_count, self.max_retries),
            format!("Created: {}", format_time(Some(self.created_at))),
        ];
        if let Some(target) = &self.target {
            lines.push(format!("Target: {target}"));
        }
        if self.scheduled_for.is_some() {
            lines.push(format!("Scheduled for: {}", format_time(self.scheduled_for)));
        }
        if self.next_retry_at.is_some() {
            lines.push(format!("Next retry: {}", format_time(self.next_retry_at)));
        }
        if self.started_at.is_some() {
            lines.push(format!("Started: {}", format_time(self.started_at)));
        }
        if self.completed_at.is_some() {
            lines.push(format!("Finished: {}", format_time(self.completed_at)));
        }
        if let Some(ms) = self.metrics.execution_time_ms {
            lines.push(format!("Execution time: {ms}ms"));
        }
        if let Some(token) = &self.claim_token {
            lines.push(format!("Claim token: {token}"));
        }
        if self.cancel_requested {
            lines.push("Cancellation requested".to_string());
        }
        if let Some(error) = &self.error_message {
            lines.push(format!("Error: {error}"));
        }
        lines.push(format!("Input: {}", self.input));
        if let Some(out) = &self.output {
            lines.push(format!("Output: {out}"));
        }
        lines.join("\n")
    }
}

/// Result of `foreman task show`.
#[derive(Debug, serde::Serialize)]
pub struct TaskDetailOutput {
    /// The task
    pub task: TaskOutput,
    /// Its ledger entries, oldest first
    pub actions: Vec<ActionOutput>,
}

impl CommandOutput for TaskDetailOutput {
    fn to_human(&self) -> String {
        let mut text = self.task.to_human();
        if !self.actions.is_empty() {
            let mut table = list_table(&["ACTION", "TOOL", "STATUS", "APPROVAL", "CREATED"]);
            for action in &self.actions {
                table.add_row(vec![
                    short_id(&action.id).to_string(),
                    action.tool_name.clone(),
                    action.status.clone(),
                    action.approval.clone(),
                    format_time(Some(action.created_at)),
                ]);
            }
            text.push_str(&format!("\n\nActions:\n{table}"));
        }
        text
    }
}

/// Result of `foreman task list` and `foreman task claim`.
#[derive(Debug, serde::Serialize)]
pub struct TaskListOutput {
    /// Matching tasks
    pub tasks: Vec<TaskOutput>,
    /// Number of tasks returned
    pub total: usize,
}

impl CommandOutput for TaskListOutput {
    fn to_human(&self) -> String {
        if self.tasks.is_empty() {
            return "No tasks found.".to_string();
        }

        let mut table = list_table(&["ID", "TENANT", "TYPE", "STATUS", "PRI", "RETRIES", "CREATED"]);
        for task in &self.tasks {
            table.add_row(vec![
                short_id(&task.id).to_string(),
                truncate(&task.tenant_id, 16),
                truncate(&task.task_type, 24),
                task.status.clone(),
                task.priority.to_string(),
                format!("{}/{}", task.retry_count, task.max_retries),
                format_time(Some(task.created_at)),
            ]);
        }
        format!("Found {} task(s):\n\n{table}", self.total)
    }
}

/// Result of `foreman task stats`.
#[derive(Debug, serde::Serialize)]
pub struct TaskStatsOutput {
    /// Tenant the counts cover; all tenants when `None`
    pub tenant_id: Option<String>,
    /// Status name and count
    pub counts: Vec<(String, u64)>,
    /// Sum of all counts
    pub total: u64,
}

impl CommandOutput for TaskStatsOutput {
    fn to_human(&self) -> String {
        let scope = self.tenant_id.as_deref().unwrap_or("all tenants");
        let mut table = list_table(&["STATUS", "COUNT"]);
        for (status, count) in &self.counts {
            table.add_row(vec![status.clone(), count.to_string()]);
        }
        format!("Tasks for {scope} ({} total):\n\n{table}", self.total)
    }
}

/// Result of a task state change.
#[derive(Debug, serde::Serialize)]
pub struct TaskActionOutput {
    /// Always `true`; failures take the error path
    pub success: bool,
    /// Human-readable summary
    pub message: String,
    /// The task after the change
    pub task: TaskOutput,
}

impl CommandOutput for TaskActionOutput {
    fn to_human(&self) -> String {
        self.message.clone()
    }
}

/// Result of `foreman task heartbeat`.
#[derive(Debug, serde::Serialize)]
pub struct HeartbeatOutput {
    /// Task id
    pub task_id: String,
    /// The worker should stop and report
    pub cancel_requested: bool,
}

impl CommandOutput for HeartbeatOutput {
    fn to_human(&self) -> String {
        if self.cancel_requested {
            format!("Task {} has a pending cancellation; stop and report.", self.task_id)
        } else {
            format!("Task {} claim renewed.", self.task_id)
        }
    }
}

/// Run a task subcommand.
pub async fn execute(args: TaskArgs, config: Config, json_mode: bool) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let service = ctx.tasks.clone();

    match args.command {
        TaskCommands::Create(create) => {
            let request = build_new_task(create, Utc::now()).await?;
            let task = service.create(request).await?;
            output(
                &TaskActionOutput {
                    success: true,
                    message: format!("Task created: {}", task.id),
                    task: TaskOutput::from(&task),
                },
                json_mode,
            );
        }
        TaskCommands::Show { id } => {
            let task = service.get(id).await?;
            let actions = service
                .ledger()
                .list(ActionFilter {
                    task_id: Some(id),
                    ..ActionFilter::default()
                })
                .await?;
            output(
                &TaskDetailOutput {
                    task: TaskOutput::from(&task),
                    actions: actions.iter().map(ActionOutput::from).collect(),
                },
                json_mode,
            );
        }
        TaskCommands::List {
            tenant,
            status,
            task_type,
            limit,
        } => {
            let status = status
                .map(|s| TaskStatus::from_str(&s).ok_or_else(|| anyhow!("Invalid status: {s}")))
                .transpose()?;
            let tasks = service
                .list(TaskFilter {
                    tenant_id: tenant,
                    status,
                    task_type,
                    limit: Some(limit),
                })
                .await?;
            let tasks: Vec<TaskOutput> = tasks.iter().map(TaskOutput::from).collect();
            output(
                &TaskListOutput {
                    total: tasks.len(),
                    tasks,
                },
                json_mode,
            );
        }
        TaskCommands::Stats { tenant } => {
            let counts = service.count_by_status(tenant.as_deref()).await?;
            let mut counts: Vec<(String, u64)> =
                counts.into_iter().map(|(status, n)| (status.as_str().to_string(), n)).collect();
            counts.sort();
            let total = counts.iter().map(|(_, n)| n).sum();
            output(
                &TaskStatsOutput {
                    tenant_id: tenant,
                    counts,
                    total,
                },
                json_mode,
            );
        }
        TaskCommands::Cancel { id } => {
            let task = service.cancel(id).await?;
            let message = if task.status == TaskStatus::Cancelled {
                format!("Task {id} cancelled.")
            } else {
                format!("Cancellation requested for running task {id}.")
            };
            output(
                &TaskActionOutput {
                    success: true,
                    message,
                    task: TaskOutput::from(&task),
                },
                json_mode,
            );
        }
        TaskCommands::Complete {
            id,
            claim_token,
            output: raw_output,
            tokens_used,
            cost_usd,
        } => {
            let value = parse_json_arg("output", &raw_output)?;
            let metrics = TaskMetrics {
                tokens_used,
                cost_usd,
                execution_time_ms: None,
            };
            let task = service.complete(id, claim_token, value, metrics).await?;
            output(
                &TaskActionOutput {
                    success: true,
                    message: format!("Task {id} completed."),
                    task: TaskOutput::from(&task),
                },
                json_mode,
            );
        }
        TaskCommands::Fail {
            id,
            claim_token,
            message,
            details,
            permanent,
        } => {
            let mut report = if permanent {
                FailureReport::permanent(message)
            } else {
                FailureReport::transient(message)
            };
            if let Some(details) = details {
                report = report.with_details(parse_json_arg("details", &details)?);
            }
            let task = service.fail(id, claim_token, report).await?;
            let message = match task.status {
                TaskStatus::Pending => format!(
                    "Task {id} will retry at {} (attempt {}/{}).",
                    format_time(task.next_retry_at),
                    task.retry_count,
                    task.max_retries
                ),
                _ => format!("Task {id} failed."),
            };
            output(
                &TaskActionOutput {
                    success: true,
                    message,
                    task: TaskOutput::from(&task),
                },
                json_mode,
            );
        }
        TaskCommands::Claim { tenant, limit } => {
            let now = Utc::now();
            let request = match tenant {
                Some(tenant_id) => {
                    let tenant = ctx
                        .config_repo
                        .get(&tenant_id)
                        .await?
                        .ok_or_else(|| anyhow!("Tenant not configured: {tenant_id}"))?;
                    ClaimRequest::for_tenant(tenant_id, limit)
                        .excluding(service.gate().excluded_task_types(&tenant, now))
                }
                None => ClaimRequest::any_tenant(limit),
            };
            let claimed = ctx.task_repo.claim(ClaimRequest { now, ..request }).await?;
            let tasks: Vec<TaskOutput> = claimed.iter().map(TaskOutput::from).collect();
            output(
                &TaskListOutput {
                    total: tasks.len(),
                    tasks,
                },
                json_mode,
            );
        }
        TaskCommands::Heartbeat { id, claim_token } => {
            let beat = service.heartbeat(id, claim_token).await?;
            output(
                &HeartbeatOutput {
                    task_id: id.to_string(),
                    cancel_requested: beat == Heartbeat::CancelRequested,
                },
                json_mode,
            );
        }
    }

    ctx.close().await;
    Ok(())
}

async fn build_new_task(args: TaskCreateArgs, now: DateTime<Utc>) -> Result<NewTask> {
    let input = match (&args.input, &args.input_file) {
        (Some(raw), _) => parse_json_arg("input", raw)?,
        (None, Some(path)) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            parse_json_arg("input", &raw)?
        }
        (None, None) => Value::Object(serde_json::Map::new()),
    };

    let mut request = NewTask::new(args.tenant, args.task_type, input);
    if let Some(priority) = args.priority {
        request = request.with_priority(priority);
    }
    if let Some(target) = &args.target {
        let target = EntityRef::parse(target).ok_or_else(|| anyhow!("Target must look like type:id, got {target}"))?;
        request = request.with_target(target);
    }
    let scheduled_for = args
        .scheduled_for
        .or_else(|| args.delay_secs.map(|secs| now + chrono::Duration::seconds(secs)));
    if let Some(at) = scheduled_for {
        request = request.with_scheduled_for(at);
    }
    if let Some(max_retries) = args.max_retries {
        request = request.with_max_retries(max_retries);
    }
    Ok(request)
}

fn parse_json_arg(name: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--{name} is not valid JSON"))
}
