//! Per-tenant scheduling configuration.

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How much the scheduler may do on a tenant's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    /// No background tasks are accepted.
    Disabled,
    /// Every tool invocation waits for approval.
    SuggestOnly,
    /// Tools flagged in the registry wait for approval.
    ConfirmActions,
    /// Only tools flagged in the registry wait for approval.
    Autonomous,
}

impl Default for AutonomyLevel {
    fn default() -> Self {
        Self::ConfirmActions
    }
}

impl AutonomyLevel {
    /// Storage and wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::SuggestOnly => "suggest_only",
            Self::ConfirmActions => "confirm_actions",
            Self::Autonomous => "autonomous",
        }
    }

    /// Parse a storage name; `None` if unknown.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "disabled" => Some(Self::Disabled),
            "suggest_only" => Some(Self::SuggestOnly),
            "confirm_actions" => Some(Self::ConfirmActions),
            "autonomous" => Some(Self::Autonomous),
            _ => None,
        }
    }

    /// Whether an action for a tool with the given registry flag needs approval.
    ///
    /// The registry flag is a floor: no level lifts the gate off a flagged tool.
    pub fn requires_approval(&self, tool_flag: bool) -> bool {
        match self {
            Self::Disabled | Self::SuggestOnly => true,
            Self::ConfirmActions | Self::Autonomous => tool_flag,
        }
    }
}

/// Window over which a creation quota is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaWindow {
    /// Calendar day in the tenant's timezone
    Daily,
    /// Calendar month in the tenant's timezone
    Monthly,
}

impl QuotaWindow {
    /// Name used in quota errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }
}

/// One row of tenant configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Tenant this row configures
    pub tenant_id: String,
    /// What may run without approval
    pub autonomy_level: AutonomyLevel,
    /// Feature keys tasks may be created for
    pub enabled_features: BTreeSet<String>,
    /// `None` means unlimited
    pub daily_task_quota: Option<u32>,
    /// `None` means unlimited
    pub monthly_task_quota: Option<u32>,
    /// Running tasks allowed at once
    pub max_concurrent_tasks: Option<u32>,
    /// Start of the daily window, local time
    pub working_hours_start: NaiveTime,
    /// End of the daily window, inclusive
    pub working_hours_end: NaiveTime,
    /// Days the window opens on
    pub working_days: Vec<Weekday>,
    /// IANA timezone name
    pub timezone: String,
    /// When the row was first stored
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl TenantConfig {
    /// Default configuration: confirm actions, weekdays 09:00-17:00 UTC, no quotas.
    pub fn new(tenant_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            tenant_id: tenant_id.into(),
            autonomy_level: AutonomyLevel::default(),
            enabled_features: BTreeSet::new(),
            daily_task_quota: None,
            monthly_task_quota: None,
            max_concurrent_tasks: None,
            working_hours_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            working_hours_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or(NaiveTime::MIN),
            working_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            timezone: "UTC".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Enable a feature.
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.enabled_features.insert(feature.into());
        self
    }

    /// Whether tasks for `feature` may be created.
    pub fn is_feature_enabled(&self, feature: &str) -> bool {
        self.enabled_features.contains(feature)
    }

    /// Parsed timezone; validated on write, so an unknown name falls back to UTC.
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }

    /// Whether `now`, in the tenant's timezone, falls inside the working window.
    ///
    /// The window is inclusive on both ends. A window whose start is after its
    /// end wraps past midnight and is attributed to the day it starts on.
    pub fn is_within_working_hours(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz());
        let time = local.time();
        let start = self.working_hours_start;
        let end = self.working_hours_end;

        if start <= end {
            self.working_days.contains(&local.weekday()) && time >= start && time <= end
        } else if time >= start {
            self.working_days.contains(&local.weekday())
        } else if time <= end {
            self.working_days.contains(&local.weekday().pred())
        } else {
            false
        }
    }

    /// Start of the quota window containing `now`, as a UTC instant.
    pub fn quota_window_start(&self, window: QuotaWindow, now: DateTime<Utc>) -> DateTime<Utc> {
        let tz = self.tz();
        let local_date = now.with_timezone(&tz).date_naive();
        let first_day = match window {
            QuotaWindow::Daily => local_date,
            QuotaWindow::Monthly => local_date.with_day(1).unwrap_or(local_date),
        };
        let midnight = first_day.and_time(NaiveTime::MIN);
        tz.from_local_datetime(&midnight)
            .earliest()
            .map_or_else(|| Utc.from_utc_datetime(&midnight), |dt| dt.with_timezone(&Utc))
    }

    /// Configured limit for a quota window.
    pub fn quota_limit(&self, window: QuotaWindow) -> Option<u32> {
        match window {
            QuotaWindow::Daily => self.daily_task_quota,
            QuotaWindow::Monthly => self.monthly_task_quota,
        }
    }

    /// Check the row before it is stored.
    pub fn validate(&self) -> Result<(), String> {
        if self.tenant_id.trim().is_empty() {
            return Err("Tenant id cannot be empty".to_string());
        }
        if self.timezone.parse::<Tz>().is_err() {
            return Err(format!("Unknown timezone: {}", self.timezone));
        }
        if self.working_days.is_empty() {
            return Err("At least one working day is required".to_string());
        }
        if self.max_concurrent_tasks == Some(0) {
            return Err("max_concurrent_tasks must be at least 1 when set".to_string());
        }
        Ok(())
    }
}
