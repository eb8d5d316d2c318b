use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backlog::{BacklogGate, SectionMemory};
use crate::claim::ClaimStore;
use crate::config::{is_valid_platform, HarvestConfig};
use crate::dedup::DedupGuard;
use crate::lifecycle::SharedLifecycle;
use crate::queue::{self, PgmqQueue};
use crate::rate::RateGate;
use crate::results::ResultBatcher;
use crate::riot::{region_of, ApiClient};
use crate::util::db::Db;
use crate::util::env as env_util;

pub fn task_queue_name(platform: &str) -> String {
    format!("harvest_tasks_{}", platform.to_ascii_lowercase())
}

pub fn result_queue_name(platform: &str) -> String {
    format!("harvest_results_{}", platform.to_ascii_lowercase())
}

/// Everything one platform's pipeline shares, with single-writer ownership
/// per field: the gate owns section memory, the batcher owns its buffer, and
/// the only multi-writer state (the rate gate deadline) is monotonic.
pub struct PlatformContext {
    pub platform: String,
    pub region: String,
    pub cfg: HarvestConfig,
    pub db: Db,
    pub api: ApiClient,
    pub claim: ClaimStore,
    pub tasks: PgmqQueue,
    pub results: PgmqQueue,
    pub gate: RateGate,
    pub dedup: DedupGuard,
    pub task_wake: Arc<Notify>,
    pub result_wake: Arc<Notify>,
    pub life: SharedLifecycle,
}

impl PlatformContext {
    pub fn new(
        platform: &str,
        cfg: HarvestConfig,
        db: Db,
        life: SharedLifecycle,
    ) -> Result<Arc<Self>> {
        if !is_valid_platform(platform) {
            bail!("invalid platform name: {platform:?}");
        }
        let api = ApiClient::new(&cfg.proxy_base, cfg.request_timeout_secs)?;
        let claim = ClaimStore::new(&db, cfg.lock_ttl_secs);
        let tasks = PgmqQueue::new(&db, task_queue_name(platform));
        let results = PgmqQueue::new(&db, result_queue_name(platform));
        Ok(Arc::new(Self {
            platform: platform.to_string(),
            region: region_of(platform).to_string(),
            cfg,
            db,
            api,
            claim,
            tasks,
            results,
            gate: RateGate::new(),
            dedup: DedupGuard::new(),
            task_wake: Arc::new(Notify::new()),
            result_wake: Arc::new(Notify::new()),
            life,
        }))
    }

    pub async fn ensure_queues(&self) -> Result<()> {
        self.tasks.ensure().await?;
        self.results.ensure().await?;
        Ok(())
    }
}

/// Forward queue NOTIFYs into the in-process wake handles. Best-effort: when
/// no LISTEN connection can be made, consumers fall back to polling alone.
async fn wire_listen(ctx: &Arc<PlatformContext>) {
    let Some(url) = env_util::listen_url() else {
        return;
    };
    let tasks_channel = ctx.tasks.name().to_string();
    let channels = vec![tasks_channel.clone(), ctx.results.name().to_string()];
    match queue::listen(&url, channels).await {
        Ok(mut rx) => {
            let task_wake = ctx.task_wake.clone();
            let result_wake = ctx.result_wake.clone();
            let life = ctx.life.clone();
            tokio::spawn(async move {
                while let Some(channel) = rx.recv().await {
                    if life.is_shutdown() {
                        break;
                    }
                    if channel == tasks_channel {
                        task_wake.notify_waiters();
                    } else {
                        result_wake.notify_waiters();
                    }
                }
            });
        }
        Err(e) => {
            warn!(platform = %ctx.platform, error = %e, "LISTEN setup failed; polling only");
        }
    }
}

/// Run one platform's full pipeline: backlog gate, fetch-worker pool, and
/// result batcher. Returns after shutdown once the components have drained,
/// or once the grace window has elapsed.
pub async fn run_platform(ctx: Arc<PlatformContext>) -> Result<()> {
    ctx.ensure_queues().await?;
    wire_listen(&ctx).await;
    info!(platform = %ctx.platform, region = %ctx.region, "pipeline up");

    let gate = BacklogGate::new(
        ctx.platform.clone(),
        ctx.claim.clone(),
        ctx.tasks.clone(),
        SectionMemory::new(ctx.cfg.sections, ctx.cfg.section_size),
        ctx.life.clone(),
        ctx.cfg.poll_interval_secs,
        ctx.cfg.starve_sleep_secs,
    );
    let batcher = ResultBatcher::new(
        ctx.results.clone(),
        ctx.claim.clone(),
        ctx.platform.clone(),
        ctx.result_wake.clone(),
        ctx.life.clone(),
        ctx.cfg.flush_secs,
        ctx.cfg.visibility_timeout_secs,
        ctx.cfg.poll_interval_secs,
    );

    let handles: Vec<JoinHandle<()>> = vec![
        tokio::spawn(gate.run()),
        tokio::spawn(crate::fetch::run_pool(ctx.clone())),
        tokio::spawn(batcher.run()),
    ];

    ctx.life.wait_shutdown().await;

    // Grace window: let in-flight fetches and the final flush complete, then
    // cut whatever is still running.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(ctx.cfg.grace_secs.max(1));
    for mut handle in handles {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(platform = %ctx.platform, error = %e, "pipeline task failed"),
            Err(_) => {
                warn!(platform = %ctx.platform, "grace window elapsed; aborting in-flight work");
                handle.abort();
            }
        }
    }
    info!(platform = %ctx.platform, "pipeline stopped");
    Ok(())
}
