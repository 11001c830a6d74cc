//! Claim protocol latency against a SQLite backlog.

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

use foreman::adapters::sqlite::{
    create_migrated_test_pool, SqliteActionRepository, SqliteTaskRepository, SqliteTenantConfigRepository,
};
use foreman::domain::models::{AutonomyLevel, TenantConfig};
use foreman::domain::ports::{ClaimRequest, TaskRepository, TenantConfigRepository, ToolContext, ToolError, ToolHandler};
use foreman::services::{NewTask, TaskService, ToolDefinition, ToolRegistry};

type Service = TaskService<SqliteTaskRepository, SqliteActionRepository, SqliteTenantConfigRepository>;

struct Noop;

#[async_trait::async_trait]
impl ToolHandler for Noop {
    async fn invoke(&self, _ctx: ToolContext) -> Result<foreman::ToolOutput, ToolError> {
        Ok(foreman::ToolOutput::new(json!(null)))
    }
}

async fn setup() -> (Arc<SqliteTaskRepository>, Arc<Service>) {
    let pool = create_migrated_test_pool().await.unwrap();
    let task_repo = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let action_repo = Arc::new(SqliteActionRepository::new(pool.clone()));
    let config_repo = Arc::new(SqliteTenantConfigRepository::new(pool));

    let mut tenant = TenantConfig::new("bench").with_feature("reports");
    tenant.autonomy_level = AutonomyLevel::Autonomous;
    config_repo.upsert(&tenant).await.unwrap();

    let registry = ToolRegistry::new()
        .with_tool(ToolDefinition::new("summarize", "reports", Arc::new(Noop)))
        .unwrap();
    let service = Arc::new(TaskService::new(task_repo.clone(), action_repo, config_repo, Arc::new(registry)));
    (task_repo, service)
}

async fn seed(service: &Service, count: usize) {
    for i in 0..count {
        service
            .create(NewTask::new("bench", "summarize", json!({ "n": i })).with_priority((i % 100) as i32))
            .await
            .unwrap();
    }
}

/// Claim latency by batch size. Each measured claim drains freshly seeded
/// tasks so the backlog depth stays constant.
fn bench_claim_batch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("claim_batch");
    group.measurement_time(Duration::from_secs(10));

    for batch in [1usize, 10, 50] {
        let (repo, service) = rt.block_on(setup());
        rt.block_on(seed(&service, 500));

        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let repo = repo.clone();
            let service = service.clone();
            b.to_async(&rt).iter_custom(move |iters| {
                let repo = repo.clone();
                let service = service.clone();
                async move {
                    let mut elapsed = Duration::ZERO;
                    for _ in 0..iters {
                        seed(&service, batch).await;
                        let start = Instant::now();
                        let claimed = repo.claim(ClaimRequest::for_tenant("bench", batch)).await.unwrap();
                        elapsed += start.elapsed();
                        black_box(claimed);
                    }
                    elapsed
                }
            });
        });
    }

    group.finish();
}

/// Claim against a backlog that is mostly not yet due.
fn bench_claim_deferred_backlog(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (repo, service) = rt.block_on(setup());
    rt.block_on(async {
        let later = chrono::Utc::now() + chrono::Duration::days(1);
        for i in 0..1_000 {
            service
                .create(NewTask::new("bench", "summarize", json!({ "n": i })).with_scheduled_for(later))
                .await
                .unwrap();
        }
    });

    c.bench_function("claim_deferred_backlog", |b| {
        let repo = repo.clone();
        let service = service.clone();
        b.to_async(&rt).iter_custom(move |iters| {
            let repo = repo.clone();
            let service = service.clone();
            async move {
                let mut elapsed = Duration::ZERO;
                for _ in 0..iters {
                    seed(&service, 1).await;
                    let start = Instant::now();
                    let claimed = repo.claim(ClaimRequest::for_tenant("bench", 10)).await.unwrap();
                    elapsed += start.elapsed();
                    black_box(claimed);
                }
                elapsed
            }
        });
    });
}

criterion_group!(benches, bench_claim_batch, bench_claim_deferred_backlog);
criterion_main!(benches);
