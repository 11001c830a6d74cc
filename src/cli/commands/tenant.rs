//! Tenant configuration CLI commands.

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveTime, Utc, Weekday};
use clap::{Args, Subcommand};

use crate::cli::context::AppContext;
use crate::cli::output::{list_table, output, CommandOutput};
use crate::domain::models::{AutonomyLevel, Config, TenantConfig};
use crate::domain::ports::TenantConfigRepository;

/// Arguments for `foreman tenant`.
#[derive(Args, Debug)]
pub struct TenantArgs {
    /// Tenant subcommand to run.
    #[command(subcommand)]
    pub command: TenantCommands,
}

/// Subcommands of `foreman tenant`.
#[derive(Subcommand, Debug)]
pub enum TenantCommands {
    /// Create or update a tenant's configuration
    Set(TenantSetArgs),
    /// Show a tenant's configuration
    Show {
        /// Tenant ID
        tenant_id: String,
    },
    /// List configured tenants
    List,
}

/// Arguments for `foreman tenant set`. Unset options keep their stored value.
#[derive(Args, Debug, Default)]
pub struct TenantSetArgs {
    /// Tenant ID
    pub tenant_id: String,

    /// Autonomy level (disabled, suggest_only, confirm_actions, autonomous)
    #[arg(short, long)]
    pub autonomy: Option<String>,

    /// Feature to enable (repeatable)
    #[arg(long = "enable", value_name = "FEATURE")]
    pub enable: Vec<String>,

    /// Feature to disable (repeatable)
    #[arg(long = "disable", value_name = "FEATURE")]
    pub disable: Vec<String>,

    /// Tasks per local day, or "none"
    #[arg(long)]
    pub daily_quota: Option<String>,

    /// Tasks per local month, or "none"
    #[arg(long)]
    pub monthly_quota: Option<String>,

    /// Concurrently running tasks, or "none"
    #[arg(long)]
    pub max_concurrent: Option<String>,

    /// Working window in local time, e.g. 09:00-17:00
    #[arg(long)]
    pub working_hours: Option<String>,

    /// Working days, e.g. mon,tue,wed,thu,fri
    #[arg(long, value_delimiter = ',')]
    pub working_days: Option<Vec<String>>,

    /// IANA timezone name, e.g. Europe/Berlin
    #[arg(long)]
    pub timezone: Option<String>,
}

/// One tenant configuration as printed by the CLI.
#[derive(Debug, serde::Serialize)]
pub struct TenantOutput {
    /// Tenant id
    pub tenant_id: String,
    /// Autonomy level name
    pub autonomy_level: String,
    /// Enabled feature keys
    pub enabled_features: Vec<String>,
    /// `None` means unlimited
    pub daily_task_quota: Option<u32>,
    /// `None` means unlimited
    pub monthly_task_quota: Option<u32>,
    /// `None` means unlimited
    pub max_concurrent_tasks: Option<u32>,
    /// Window as `HH:MM-HH:MM`
    pub working_hours: String,
    /// Short weekday names
    pub working_days: Vec<String>,
    /// IANA timezone name
    pub timezone: String,
    /// Whether the window is open right now
    pub within_working_hours: bool,
    /// Last change, RFC 3339
    pub updated_at: String,
}

impl From<&TenantConfig> for TenantOutput {
    fn from(config: &TenantConfig) -> Self {
        Self {
            tenant_id: config.tenant_id.clone(),
            autonomy_level: config.autonomy_level.as_str().to_string(),
            enabled_features: config.enabled_features.iter().cloned().collect(),
            daily_task_quota: config.daily_task_quota,
            monthly_task_quota: config.monthly_task_quota,
            max_concurrent_tasks: config.max_concurrent_tasks,
            working_hours: format!(
                "{}-{}",
                config.working_hours_start.format("%H:%M"),
                config.working_hours_end.format("%H:%M")
            ),
            working_days: config.working_days.iter().map(ToString::to_string).collect(),
            timezone: config.timezone.clone(),
            within_working_hours: config.is_within_working_hours(Utc::now()),
            updated_at: config.updated_at.to_rfc3339(),
        }
    }
}

fn limit_label(limit: Option<u32>) -> String {
    limit.map_or_else(|| "unlimited".to_string(), |n| n.to_string())
}

impl CommandOutput for TenantOutput {
    fn to_human(&self) -> String {
        let features = if self.enabled_features.is_empty() {
            "(none)".to_string()
        } else {
            self.enabled_features.join(", ")
        };
        [
            format!("Tenant: {}", self.tenant_id),
            format!("Autonomy: {}", self.autonomy_level),
            format!("Features: {features}"),
            format!("Daily quota: {}", limit_label(self.daily_task_quota)),
            format!("Monthly quota: {}", limit_label(self.monthly_task_quota)),
            format!("Max concurrent: {}", limit_label(self.max_concurrent_tasks)),
            format!(
                "Working hours: {} {} ({})",
                self.working_hours,
                self.timezone,
                self.working_days.join(",")
            ),
            format!("In working hours now: {}", self.within_working_hours),
        ]
        .join("\n")
    }
}

/// Result of `foreman tenant list`.
#[derive(Debug, serde::Serialize)]
pub struct TenantListOutput {
    /// Configured tenants
    pub tenants: Vec<TenantOutput>,
    /// Number of tenants
    pub total: usize,
}

impl CommandOutput for TenantListOutput {
    fn to_human(&self) -> String {
        if self.tenants.is_empty() {
            return "No tenants configured.".to_string();
        }

        let mut table = list_table(&["TENANT", "AUTONOMY", "FEATURES", "DAILY", "MONTHLY", "CONCURRENT", "TIMEZONE"]);
        for tenant in &self.tenants {
            table.add_row(vec![
                tenant.tenant_id.clone(),
                tenant.autonomy_level.clone(),
                tenant.enabled_features.join(","),
                limit_label(tenant.daily_task_quota),
                limit_label(tenant.monthly_task_quota),
                limit_label(tenant.max_concurrent_tasks),
                tenant.timezone.clone(),
            ]);
        }
        format!("Found {} tenant(s):\n\n{table}", self.total)
    }
}

/// Result of `foreman tenant set`.
#[derive(Debug, serde::Serialize)]
pub struct TenantActionOutput {
    /// Always `true`; failures take the error path
    pub success: bool,
    /// Human-readable summary
    pub message: String,
    /// The stored configuration
    pub tenant: TenantOutput,
}

impl CommandOutput for TenantActionOutput {
    fn to_human(&self) -> String {
        format!("{}\n\n{}", self.message, self.tenant.to_human())
    }
}

/// Run a tenant subcommand.
pub async fn execute(args: TenantArgs, config: Config, json_mode: bool) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let repo = ctx.config_repo.clone();

    match args.command {
        TenantCommands::Set(set) => {
            let existing = repo.get(&set.tenant_id).await?;
            let created = existing.is_none();
            let mut tenant = existing.unwrap_or_else(|| TenantConfig::new(set.tenant_id.clone()));
            apply(&mut tenant, &set)?;
            tenant.updated_at = Utc::now();
            tenant.validate().map_err(|e| anyhow!(e))?;
            repo.upsert(&tenant).await?;

            let verb = if created { "created" } else { "updated" };
            output(
                &TenantActionOutput {
                    success: true,
                    message: format!("Tenant {} {verb}.", tenant.tenant_id),
                    tenant: TenantOutput::from(&tenant),
                },
                json_mode,
            );
        }
        TenantCommands::Show { tenant_id } => {
            let tenant = repo
                .get(&tenant_id)
                .await?
                .ok_or_else(|| anyhow!("Tenant not configured: {tenant_id}"))?;
            output(&TenantOutput::from(&tenant), json_mode);
        }
        TenantCommands::List => {
            let tenants: Vec<TenantOutput> = repo.list().await?.iter().map(TenantOutput::from).collect();
            output(
                &TenantListOutput {
                    total: tenants.len(),
                    tenants,
                },
                json_mode,
            );
        }
    }

    ctx.close().await;
    Ok(())
}

/// Apply the flags that were given; everything else keeps its current value.
fn apply(tenant: &mut TenantConfig, set: &TenantSetArgs) -> Result<()> {
    if let Some(level) = &set.autonomy {
        tenant.autonomy_level =
            AutonomyLevel::from_str(level).ok_or_else(|| anyhow!("Invalid autonomy level: {level}"))?;
    }
    for feature in &set.enable {
        tenant.enabled_features.insert(feature.clone());
    }
    for feature in &set.disable {
        tenant.enabled_features.remove(feature);
    }
    if let Some(quota) = &set.daily_quota {
        tenant.daily_task_quota = parse_limit(quota)?;
    }
    if let Some(quota) = &set.monthly_quota {
        tenant.monthly_task_quota = parse_limit(quota)?;
    }
    if let Some(max) = &set.max_concurrent {
        tenant.max_concurrent_tasks = parse_limit(max)?;
    }
    if let Some(window) = &set.working_hours {
        let (start, end) = parse_window(window)?;
        tenant.working_hours_start = start;
        tenant.working_hours_end = end;
    }
    if let Some(days) = &set.working_days {
        tenant.working_days = days
            .iter()
            .map(|d| d.trim().parse::<Weekday>().map_err(|_| anyhow!("Invalid weekday: {d}")))
            .collect::<Result<_>>()?;
    }
    if let Some(tz) = &set.timezone {
        tenant.timezone.clone_from(tz);
    }
    Ok(())
}

fn parse_limit(value: &str) -> Result<Option<u32>> {
    match value.trim().to_lowercase().as_str() {
        "none" | "unlimited" => Ok(None),
        n => n.parse().map(Some).with_context(|| format!("Invalid limit: {value}")),
    }
}

fn parse_window(value: &str) -> Result<(NaiveTime, NaiveTime)> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| anyhow!("Working hours must look like 09:00-17:00"))?;
    let parse = |s: &str| {
        NaiveTime::parse_from_str(s.trim(), "%H:%M").with_context(|| format!("Invalid time of day: {s}"))
    };
    Ok((parse(start)?, parse(end)?))
}
