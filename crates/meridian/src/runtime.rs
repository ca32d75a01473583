//! Runtime wiring: store, recovery, router registration, worker pool,
//! graceful shutdown.

use crate::planner::UnconfiguredPlanner;
use anyhow::{Context, Result};
use meridian_audit::AuditLog;
use meridian_axis::{
    recover_jobs, GearRuntimeHandler, JobQueue, JournalStore, PipelineProcessor, QueueSpawner,
    Router, ScoutHandler, SentinelHandler, WorkerPool,
};
use meridian_db::Store;
use meridian_gear::builtin::{ClockGear, FileManagerGear, HttpGear};
use meridian_gear::{GearRuntime, SandboxPolicy, SecretsVault, ShellGear};
use meridian_protocol::{ComponentId, DataDir, MeridianConfig};
use meridian_sentinel::{ApprovalCache, DecisionMemory};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Grace period for in-flight work on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(
    data_dir: DataDir,
    config: MeridianConfig,
    workers_override: Option<usize>,
) -> Result<()> {
    let workspace = config.workspace_root(data_dir.root());
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;

    let store = Store::new(data_dir.clone());
    let queue = JobQueue::open(&store, config.dedup_window_ms)
        .await
        .context("failed to open the primary partition")?;
    let audit = AuditLog::new(store.clone());
    let journal = JournalStore::open(&store)
        .await
        .context("failed to open the journal partition")?;
    let decisions = DecisionMemory::open(store.clone(), config.decision_memory_cap)
        .await
        .context("failed to open the sentinel partition")?;
    let approvals = Arc::new(ApprovalCache::new(
        Duration::from_millis(config.approval_cache_ttl_ms),
        config.approval_cache_max_entries,
    ));

    // Crash recovery runs before any worker can claim.
    let summary = recover_jobs(queue.pool()).await?;
    if !summary.reset_job_ids.is_empty() || summary.failed_execution_entries > 0 {
        info!(
            reset = summary.reset_job_ids.len(),
            failed_entries = summary.failed_execution_entries,
            "recovered stale state from previous run"
        );
    }

    // Gear hosting.
    let vault = SecretsVault::load(&data_dir.secrets_vault())
        .context("failed to load the secrets vault")?;
    let mut policy = SandboxPolicy::new(&workspace)
        .with_allowlist(config.allowlisted_domains.clone());
    policy.max_output_bytes = config.max_output_bytes;
    policy.max_fetch_bytes = config.max_fetch_bytes;

    let gears = GearRuntime::new(policy, vault);
    gears.register(Arc::new(FileManagerGear::new())).await;
    gears.register(Arc::new(ClockGear::new())).await;
    gears
        .register(Arc::new(HttpGear::new(config.allowlisted_domains.clone())))
        .await;
    if config.shell_enabled {
        warn!("shell gear is ENABLED; shell steps carry critical risk");
    }
    gears.register(Arc::new(ShellGear::new(config.shell_enabled))).await;
    gears
        .set_spawner(Arc::new(QueueSpawner::new(queue.clone())))
        .await;
    let gears = Arc::new(gears);

    // The fabric.
    let router = Router::new();
    router.register(
        ComponentId::Scout,
        Arc::new(ScoutHandler::new(Arc::new(UnconfiguredPlanner))),
    );
    router.register(
        ComponentId::Sentinel,
        Arc::new(SentinelHandler::new(config.policy_config(data_dir.root()))),
    );
    router.register(
        ComponentId::GearRuntime,
        Arc::new(GearRuntimeHandler::new(Arc::clone(&gears))),
    );

    let pipeline = Arc::new(PipelineProcessor::new(
        queue.clone(),
        router,
        audit,
        journal,
        gears,
        decisions,
        approvals,
    ));

    let workers = workers_override.unwrap_or(config.workers);
    let mut pool = WorkerPool::new(queue.clone(), pipeline, workers);
    pool.start();
    info!(workers, data_dir = %data_dir.root().display(), "meridian is running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    let stop = pool.stop();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, stop).await.is_err() {
        warn!("workers did not stop within the grace period");
    }
    store.close_all().await;
    info!("shutdown complete");
    Ok(())
}
