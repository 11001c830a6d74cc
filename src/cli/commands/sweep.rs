//! `foreman sweep`: one reconciliation pass, for cron or manual recovery.

use anyhow::Result;
use clap::Args;

use crate::cli::context::AppContext;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;
use crate::services::SweepReport;

/// Arguments for `foreman sweep`.
#[derive(Args, Debug)]
pub struct SweepArgs {
    /// Override the configured stale threshold, in seconds
    #[arg(long)]
    pub stale_after_secs: Option<u64>,
}

impl CommandOutput for SweepReport {
    fn to_human(&self) -> String {
        if self.is_empty() {
            return "Nothing to reconcile.".to_string();
        }
        format!(
            "Requeued {} orphaned task(s), cancelled {}, skipped {} that changed mid-sweep, closed {} stale action(s).",
            self.requeued, self.cancelled, self.skipped, self.actions_closed
        )
    }
}

/// Run one reconciliation pass.
pub async fn execute(args: SweepArgs, mut config: Config, json_mode: bool) -> Result<()> {
    if let Some(secs) = args.stale_after_secs {
        config.reconciliation.stale_threshold_secs = secs;
    }
    let ctx = AppContext::open(config).await?;
    let report = ctx.sweep().sweep_once().await?;
    output(&report, json_mode);
    ctx.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_text() {
        assert_eq!(SweepReport::default().to_human(), "Nothing to reconcile.");
        let report = SweepReport {
            requeued: 2,
            cancelled: 1,
            skipped: 0,
            actions_closed: 3,
        };
        assert!(report.to_human().starts_with("Requeued 2 orphaned task(s), cancelled 1"));
    }
}
