//! Dispatch loop: claims due work per tenant and hands it to executors.
//!
//! Each cycle reads one configuration snapshot, then for every active tenant
//! claims at most `min(batch_size, free workers, tenant headroom)` tasks,
//! leaving background tools alone outside working hours. A semaphore bounds
//! concurrent executions in this process; other processes may dispatch
//! against the same database, and the claim protocol keeps them apart.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::DispatcherConfig;
use crate::domain::ports::{ActionRepository, ClaimRequest, TaskRepository, TenantConfigRepository};
use crate::services::config_gate::ConfigSnapshot;
use crate::services::executor::Executor;
use crate::services::task_service::TaskService;

/// What one dispatch cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Active tenants in the snapshot
    pub tenants_considered: usize,
    /// Tasks claimed and handed to workers
    pub claimed: usize,
}

/// Claims due tasks per tenant and runs them on a bounded worker pool.
pub struct Dispatcher<T: TaskRepository, A: ActionRepository, C: TenantConfigRepository> {
    tasks: Arc<TaskService<T, A, C>>,
    task_repo: Arc<T>,
    config_repo: Arc<C>,
    executor: Arc<Executor<T, A, C>>,
    config: DispatcherConfig,
    workers: Arc<Semaphore>,
}

impl<T, A, C> Dispatcher<T, A, C>
where
    T: TaskRepository + 'static,
    A: ActionRepository + 'static,
    C: TenantConfigRepository + 'static,
{
    /// Dispatcher with its own executor and a pool of `max_workers` permits.
    pub fn new(
        tasks: Arc<TaskService<T, A, C>>,
        task_repo: Arc<T>,
        config_repo: Arc<C>,
        config: DispatcherConfig,
    ) -> Self {
        let executor = Arc::new(Executor::new(tasks.clone(), config.heartbeat_interval()));
        Self {
            workers: Arc::new(Semaphore::new(config.max_workers)),
            tasks,
            task_repo,
            config_repo,
            executor,
            config,
        }
    }

    /// Tasks currently executing in this process.
    pub fn in_flight(&self) -> usize {
        self.config.max_workers.saturating_sub(self.workers.available_permits())
    }

    /// Run one dispatch cycle. Claimed tasks execute in the background.
    pub async fn run_cycle(&self) -> DomainResult<CycleReport> {
        let snapshot = ConfigSnapshot::load(self.config_repo.as_ref()).await?;
        let now = Utc::now();
        let gate = self.tasks.gate();
        let mut report = CycleReport::default();

        for tenant in snapshot.active_tenants() {
            let free = self.workers.available_permits();
            if free == 0 {
                debug!("All workers busy, ending cycle early");
                break;
            }
            report.tenants_considered += 1;

            let budget = gate.claim_budget(tenant, self.config.batch_size.min(free)).await?;
            if budget == 0 {
                debug!(tenant_id = %tenant.tenant_id, "Tenant at concurrency cap");
                continue;
            }

            let request = ClaimRequest::for_tenant(tenant.tenant_id.clone(), budget)
                .excluding(gate.excluded_task_types(tenant, now));
            let claimed = self.task_repo.claim(ClaimRequest { now, ..request }).await?;

            for task in claimed {
                let permit = self
                    .workers
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| DomainError::Transient("Worker pool closed".to_string()))?;
                let executor = self.executor.clone();
                let config = tenant.clone();
                let task_id = task.id;

                tokio::spawn(async move {
                    let _permit = permit;
                    match executor.execute(task, Some(&config)).await {
                        Ok(outcome) => debug!(%task_id, ?outcome, "Execution finished"),
                        Err(e) => error!(%task_id, error = %e, "Execution aborted, leaving task to the sweep"),
                    }
                });
                report.claimed += 1;
            }
        }

        if report.claimed > 0 {
            info!(claimed = report.claimed, in_flight = self.in_flight(), "Dispatched tasks");
        }
        Ok(report)
    }

    /// Poll until `shutdown` fires, then wait for in-flight executions.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            batch_size = self.config.batch_size,
            max_workers = self.config.max_workers,
            "Dispatcher started"
        );

        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures = Self::failure_backoff(self.config.poll_interval());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle().await {
                Ok(_) => failures.reset(),
                Err(e) => {
                    let delay = failures.next_backoff().unwrap_or(self.config.poll_interval());
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Dispatch cycle failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(in_flight = self.in_flight(), "Dispatcher stopping, draining workers");
        self.wait_idle().await;
        info!("Dispatcher stopped");
    }

    /// Wait until no execution is in flight.
    pub async fn wait_idle(&self) {
        let total = u32::try_from(self.config.max_workers).unwrap_or(u32::MAX);
        if let Ok(all) = self.workers.acquire_many(total).await {
            drop(all);
        }
    }

    fn failure_backoff(poll_interval: Duration) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(poll_interval)
            .with_max_interval(poll_interval.saturating_mul(12))
            .with_max_elapsed_time(None)
            .build()
    }
}
