//! Reconciliation sweep: recovers tasks whose workers went away.
//!
//! A running task whose last heartbeat is older than the stale threshold is
//! requeued without spending a retry, or cancelled if cancellation had been
//! requested. Each recovery is a compare-and-swap on the version the sweep
//! read, so a worker that heartbeats in between keeps its task.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{ReconciliationConfig, TaskStatus};
use crate::domain::ports::{ActionRepository, TaskRepository, TenantConfigRepository};
use crate::services::task_service::TaskService;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Orphans returned to `pending`
    pub requeued: usize,
    /// Orphans with a cancellation request, now `cancelled`
    pub cancelled: usize,
    /// Stale candidates that changed before the sweep could take them
    pub skipped: usize,
    /// Pending actions closed because their task had finished
    pub actions_closed: u64,
}

impl SweepReport {
    /// Whether the sweep changed nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Recovers running tasks whose worker stopped heartbeating.
pub struct ReconciliationSweep<T: TaskRepository, A: ActionRepository, C: TenantConfigRepository> {
    tasks: Arc<TaskService<T, A, C>>,
    task_repo: Arc<T>,
    config: ReconciliationConfig,
}

impl<T: TaskRepository, A: ActionRepository, C: TenantConfigRepository> ReconciliationSweep<T, A, C> {
    /// Sweep with the given thresholds.
    pub fn new(tasks: Arc<TaskService<T, A, C>>, task_repo: Arc<T>, config: ReconciliationConfig) -> Self {
        Self {
            tasks,
            task_repo,
            config,
        }
    }

    /// One pass over stale running tasks.
    pub async fn sweep_once(&self) -> DomainResult<SweepReport> {
        let threshold_secs = i64::try_from(self.config.stale_threshold_secs).unwrap_or(i64::MAX);
        let threshold = Utc::now() - chrono::Duration::seconds(threshold_secs);
        let stale = self.task_repo.list_stale_running(threshold).await?;
        let mut report = SweepReport::default();

        for task in &stale {
            match self.tasks.recover_orphan(task).await? {
                Some(recovered) if recovered.status == TaskStatus::Cancelled => {
                    info!(task_id = %task.id, "Orphaned task had a cancellation request, cancelled");
                    report.cancelled += 1;
                }
                Some(_) => {
                    info!(
                        task_id = %task.id,
                        last_heartbeat = ?task.heartbeat_at,
                        retry_count = task.retry_count,
                        "Requeued orphaned task"
                    );
                    report.requeued += 1;
                }
                None => report.skipped += 1,
            }
        }

        report.actions_closed = self.tasks.ledger().close_orphaned().await?;

        if report.is_empty() {
            debug!("Sweep found nothing to reconcile");
        } else {
            info!(
                requeued = report.requeued,
                cancelled = report.cancelled,
                skipped = report.skipped,
                actions_closed = report.actions_closed,
                "Reconciliation sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `sweep_interval_secs` until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            stale_threshold_secs = self.config.stale_threshold_secs,
            sweep_interval_secs = self.config.sweep_interval_secs,
            "Reconciliation sweep started"
        );

        let mut ticker = interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "Reconciliation sweep failed");
                    }
                }
            }
        }

        info!("Reconciliation sweep stopped");
    }
}
