use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backlog::HarvestTask;
use crate::platform::PlatformContext;
use crate::queue::Delivery;
use crate::rate::NO_WINDOW_HOLD;
use crate::results::{MatchRef, ResolvedSummoner, ResultRecord};
use crate::riot::{parse_summoner, ApiResponse, SummonerDto};

/// Hold before retrying a generic transient failure (non-200 status or a
/// dropped proxy connection).
const TRANSIENT_HOLD: Duration = Duration::from_millis(100);

/// What to do with the originating queue message once a task settles.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Ack,
    Requeue,
    Archive,
}

/// Pagination bounds for one history scan.
#[derive(Debug, Clone)]
pub struct ScanBounds {
    pub match_cap: i64,
    pub page_size: i64,
    pub queue_filter: Option<i32>,
}

/// Outcome of paging one player's history. `newest_match` is `None` when no
/// page-0 watermark was observed; the stored watermark is left unchanged in
/// that case.
#[derive(Debug)]
pub struct HistoryScan {
    pub matches: Vec<MatchRef>,
    pub newest_match: Option<i64>,
}

#[derive(Debug)]
pub enum Page {
    /// Match ids, newest first.
    Items(Vec<String>),
    /// History endpoint 404'd; stop paging, the player result stands.
    NotFound,
}

/// Seam between the pagination state machine and the upstream. The real
/// implementation resolves transient statuses internally, so `fetch` only
/// returns terminal pages.
#[async_trait]
pub trait MatchIdSource: Send + Sync {
    async fn fetch(&self, start: i64) -> Result<Page>;
}

/// Match ids arrive as `"<PLATFORM>_<numeric id>"`.
fn split_match_id(raw: &str) -> Option<(&str, i64)> {
    let (shard, id) = raw.split_once('_')?;
    if shard.is_empty() {
        return None;
    }
    id.parse::<i64>().ok().map(|id| (shard, id))
}

/// Page through a history newest-first until the item cap, the sentinel, or
/// an empty page. Items at and beyond the sentinel are assumed to have been
/// fetched in a previous pass. Pages are strictly descending by recency, so
/// the first id of page 0 is the new watermark. Derived matches are
/// deduplicated by full value equality.
pub async fn scan_history(
    src: &dyn MatchIdSource,
    sentinel: Option<i64>,
    bounds: &ScanBounds,
) -> Result<HistoryScan> {
    let mut start = 0i64;
    let mut newest: Option<i64> = None;
    let mut found_sentinel = false;
    let mut matches: Vec<MatchRef> = Vec::new();
    let mut seen: HashSet<MatchRef> = HashSet::new();

    while start < bounds.match_cap && !found_sentinel {
        let ids = match src.fetch(start).await? {
            Page::NotFound => break,
            Page::Items(ids) => ids,
        };
        if ids.is_empty() {
            break;
        }
        if start == 0 {
            if let Some((_, id)) = split_match_id(&ids[0]) {
                newest = Some(id);
            }
        }
        for raw in &ids {
            let Some((shard, id)) = split_match_id(raw) else {
                debug!(raw = %raw, "unparseable match id; skipping");
                continue;
            };
            if sentinel == Some(id) {
                found_sentinel = true;
                break;
            }
            let m = MatchRef {
                platform: shard.to_string(),
                match_id: id,
                queue_type: bounds.queue_filter,
            };
            if seen.insert(m.clone()) {
                matches.push(m);
            }
        }
        start += bounds.page_size;
    }

    Ok(HistoryScan {
        matches,
        newest_match: newest,
    })
}

/// Live page source: consults the shared rate gate before every request and
/// retries transient statuses in place.
struct UpstreamHistory<'a> {
    ctx: &'a PlatformContext,
    puuid: &'a str,
    start_time: i64,
}

#[async_trait]
impl MatchIdSource for UpstreamHistory<'_> {
    async fn fetch(&self, start: i64) -> Result<Page> {
        loop {
            if self.ctx.life.is_shutdown() {
                anyhow::bail!("shutdown during history fetch");
            }
            self.ctx.gate.wait_ready(&self.ctx.life).await;
            let url = self.ctx.api.match_ids_url(
                &self.ctx.region,
                self.puuid,
                start,
                self.ctx.cfg.page_size,
                self.start_time,
                self.ctx.cfg.queue_filter,
            )?;
            match self.ctx.api.get(&url).await {
                ApiResponse::Ok(v) => {
                    let ids: Vec<String> =
                        serde_json::from_value(v).context("match id page shape")?;
                    return Ok(Page::Items(ids));
                }
                ApiResponse::NotFound => return Ok(Page::NotFound),
                ApiResponse::RateLimited {
                    retry_at: Some(at),
                } => self.ctx.gate.throttle_until(at),
                ApiResponse::RateLimited { retry_at: None } => {
                    self.ctx.life.sleep_unless_shutdown(NO_WINDOW_HOLD).await;
                }
                ApiResponse::Transient { status } => {
                    debug!(?status, "transient history response");
                    self.ctx.life.sleep_unless_shutdown(TRANSIENT_HOLD).await;
                }
            }
        }
    }
}

enum Resolved {
    Summoner(SummonerDto),
    NotFound,
    Malformed,
    Shutdown,
}

/// Resolve the player's durable identity, retrying transient statuses.
async fn resolve_summoner(ctx: &PlatformContext, summoner_id: &str) -> Resolved {
    let url = ctx.api.summoner_url(&ctx.platform, summoner_id);
    loop {
        if ctx.life.is_shutdown() {
            return Resolved::Shutdown;
        }
        ctx.gate.wait_ready(&ctx.life).await;
        match ctx.api.get(&url).await {
            ApiResponse::Ok(v) => match parse_summoner(v) {
                Ok(dto) => return Resolved::Summoner(dto),
                Err(e) => {
                    warn!(summoner_id, error = %e, "malformed summoner payload");
                    return Resolved::Malformed;
                }
            },
            ApiResponse::NotFound => return Resolved::NotFound,
            ApiResponse::RateLimited {
                retry_at: Some(at),
            } => ctx.gate.throttle_until(at),
            ApiResponse::RateLimited { retry_at: None } => {
                ctx.life.sleep_unless_shutdown(NO_WINDOW_HOLD).await;
            }
            ApiResponse::Transient { status } => {
                debug!(summoner_id, ?status, "transient summoner response");
                ctx.life.sleep_unless_shutdown(TRANSIENT_HOLD).await;
            }
        }
    }
}

/// Publish a task's records to the results queue and nudge the batcher.
async fn emit(ctx: &PlatformContext, records: &[ResultRecord]) -> Result<()> {
    ctx.results.send_batch(records).await?;
    if let Err(e) = ctx.results.notify().await {
        debug!(platform = %ctx.platform, error = %e, "result notify failed");
    }
    Ok(())
}

/// Run one task to a terminal outcome. Every failure maps onto the queue
/// protocol: transient problems requeue, poison payloads archive.
async fn process_task(ctx: &PlatformContext, task: &HarvestTask) -> Disposition {
    let dto = match resolve_summoner(ctx, &task.summoner_id).await {
        Resolved::Summoner(dto) => dto,
        Resolved::NotFound => {
            let record = ResultRecord::NotFound {
                summoner_id: task.summoner_id.clone(),
            };
            return match emit(ctx, std::slice::from_ref(&record)).await {
                Ok(()) => Disposition::Ack,
                Err(e) => {
                    warn!(platform = %ctx.platform, error = %e, "result publish failed");
                    Disposition::Requeue
                }
            };
        }
        Resolved::Malformed => return Disposition::Archive,
        Resolved::Shutdown => return Disposition::Requeue,
    };

    let start_time = (Utc::now() - chrono::Duration::days(ctx.cfg.history_days)).timestamp();
    let source = UpstreamHistory {
        ctx,
        puuid: &dto.puuid,
        start_time,
    };
    let bounds = ScanBounds {
        match_cap: ctx.cfg.match_cap,
        page_size: ctx.cfg.page_size,
        queue_filter: ctx.cfg.queue_filter,
    };
    let scan = match scan_history(&source, task.latest_match, &bounds).await {
        Ok(scan) => scan,
        Err(_) if ctx.life.is_shutdown() => return Disposition::Requeue,
        Err(e) => {
            warn!(platform = %ctx.platform, summoner_id = %task.summoner_id, error = %e,
                  "history scan aborted");
            return Disposition::Archive;
        }
    };

    let mut records = Vec::with_capacity(scan.matches.len() + 1);
    records.push(ResultRecord::Found(ResolvedSummoner {
        summoner_id: task.summoner_id.clone(),
        puuid: dto.puuid,
        name: dto.name,
        revision_ms: dto.revision_date,
        newest_match: scan.newest_match,
    }));
    let found = scan.matches.len();
    records.extend(scan.matches.into_iter().map(ResultRecord::Match));

    match emit(ctx, &records).await {
        Ok(()) => {
            info!(platform = %ctx.platform, summoner_id = %task.summoner_id, matches = found,
                  "updated player");
            Disposition::Ack
        }
        Err(e) => {
            warn!(platform = %ctx.platform, error = %e, "result publish failed");
            Disposition::Requeue
        }
    }
}

async fn process_delivery(ctx: &PlatformContext, delivery: Delivery<HarvestTask>) {
    let task = delivery.body;

    // A second delivery for an id already in flight here is superseded by the
    // local task; drop it without touching the upstream.
    if !ctx.dedup.begin(&task.summoner_id) {
        debug!(platform = %ctx.platform, summoner_id = %task.summoner_id,
               "already in flight; dropping duplicate delivery");
        if let Err(e) = ctx.tasks.ack(delivery.msg_id).await {
            warn!(platform = %ctx.platform, error = %e, "duplicate ack failed");
        }
        return;
    }

    let disposition = process_task(ctx, &task).await;
    ctx.dedup.finish(&task.summoner_id);

    let settled = match disposition {
        Disposition::Ack => ctx.tasks.ack(delivery.msg_id).await,
        Disposition::Requeue => ctx.tasks.reject_requeue(delivery.msg_id, 0).await,
        Disposition::Archive => ctx.tasks.reject_drop(delivery.msg_id).await,
    };
    if let Err(e) = settled {
        // The lease will lapse and the message redelivers; downstream writes
        // are idempotent either way.
        warn!(platform = %ctx.platform, msg_id = delivery.msg_id, error = %e,
              "task settle failed");
    }
}

/// One pool worker. Exits when shutdown is requested or when the supervisor
/// shrinks the pool below this worker's index.
async fn run_worker(ctx: Arc<PlatformContext>, idx: usize, desired: watch::Receiver<usize>) {
    debug!(platform = %ctx.platform, idx, "worker up");
    loop {
        if ctx.life.is_shutdown() {
            break;
        }
        if *desired.borrow() <= idx {
            debug!(platform = %ctx.platform, idx, "worker retiring");
            break;
        }
        match ctx
            .tasks
            .read_one::<HarvestTask>(ctx.cfg.visibility_timeout_secs)
            .await
        {
            Ok(Some(delivery)) => process_delivery(&ctx, delivery).await,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(ctx.cfg.poll_interval_secs)) => {}
                    _ = ctx.task_wake.notified() => {}
                    _ = ctx.life.wait_shutdown() => {}
                }
            }
            Err(e) => {
                warn!(platform = %ctx.platform, idx, error = %e, "task read failed");
                ctx.life
                    .sleep_unless_shutdown(Duration::from_secs(1))
                    .await;
            }
        }
    }
    debug!(platform = %ctx.platform, idx, "worker down");
}

/// Pool supervisor: sizes the worker pool to the task backlog, between the
/// configured floor and ceiling. Workers that die on their own are not
/// replaced; the reduced pool shows up in the logs.
pub async fn run_pool(ctx: Arc<PlatformContext>) {
    let floor = ctx.cfg.worker_floor;
    let ceiling = ctx.cfg.worker_ceiling;
    let (desired_tx, desired_rx) = watch::channel(0usize);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    let mut spawned = 0usize;

    while !ctx.life.is_shutdown() {
        let depth = match ctx.tasks.depth().await {
            Ok(d) => d,
            Err(e) => {
                warn!(platform = %ctx.platform, error = %e, "depth check failed");
                0
            }
        };
        let desired = usize::try_from(depth / ctx.cfg.tasks_per_worker)
            .unwrap_or(0)
            .clamp(floor, ceiling);
        if desired != spawned {
            info!(platform = %ctx.platform, from = spawned, to = desired, "resizing worker pool");
            let _ = desired_tx.send(desired);
            for idx in spawned..desired {
                handles.push(tokio::spawn(run_worker(
                    ctx.clone(),
                    idx,
                    desired_rx.clone(),
                )));
            }
            spawned = desired;
        }
        if ctx
            .life
            .sleep_unless_shutdown(Duration::from_secs(ctx.cfg.resize_secs))
            .await
        {
            break;
        }
    }

    for handle in handles {
        if let Err(e) = handle.await {
            // Loop-boundary catch: a crashed worker ends itself, not the
            // process.
            error!(platform = %ctx.platform, error = %e, "worker task failed");
        }
    }
    debug!(platform = %ctx.platform, "worker pool stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubSource {
        pages: Vec<Vec<String>>,
        page_size: i64,
        fetched: Mutex<Vec<i64>>,
    }

    impl StubSource {
        fn new(pages: Vec<Vec<&str>>, page_size: i64) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .map(|p| p.into_iter().map(String::from).collect())
                    .collect(),
                page_size,
                fetched: Mutex::new(Vec::new()),
            }
        }

        fn fetch_count(&self) -> usize {
            self.fetched.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MatchIdSource for StubSource {
        async fn fetch(&self, start: i64) -> Result<Page> {
            self.fetched.lock().unwrap().push(start);
            let idx = (start / self.page_size) as usize;
            Ok(Page::Items(
                self.pages.get(idx).cloned().unwrap_or_default(),
            ))
        }
    }

    fn bounds(cap: i64, page: i64) -> ScanBounds {
        ScanBounds {
            match_cap: cap,
            page_size: page,
            queue_filter: None,
        }
    }

    #[tokio::test]
    async fn stops_at_sentinel_and_keeps_earlier_items() {
        // Sentinel sits at position 1 of page 2: pages 0 and 1 complete,
        // page 2 contributes only the item before the sentinel.
        let src = StubSource::new(
            vec![
                vec!["EUW1_100", "EUW1_99"],
                vec!["EUW1_98", "EUW1_97"],
                vec!["EUW1_96", "EUW1_95", "EUW1_94"],
            ],
            2,
        );
        let scan = scan_history(&src, Some(95), &bounds(100, 2)).await.unwrap();
        let ids: Vec<i64> = scan.matches.iter().map(|m| m.match_id).collect();
        assert_eq!(ids, vec![100, 99, 98, 97, 96]);
        assert_eq!(scan.newest_match, Some(100));
        assert_eq!(src.fetch_count(), 3);
    }

    #[tokio::test]
    async fn stops_on_empty_page() {
        let src = StubSource::new(vec![vec!["EUW1_3", "EUW1_2"], vec![]], 2);
        let scan = scan_history(&src, None, &bounds(100, 2)).await.unwrap();
        assert_eq!(scan.matches.len(), 2);
        assert_eq!(src.fetch_count(), 2);
    }

    #[tokio::test]
    async fn stops_at_item_cap() {
        let src = StubSource::new(
            vec![vec!["EUW1_9", "EUW1_8"], vec!["EUW1_7", "EUW1_6"]],
            2,
        );
        let scan = scan_history(&src, None, &bounds(2, 2)).await.unwrap();
        assert_eq!(scan.matches.len(), 2);
        assert_eq!(src.fetch_count(), 1);
    }

    #[tokio::test]
    async fn sentinel_on_first_item_leaves_watermark_at_sentinel() {
        let src = StubSource::new(vec![vec!["EUW1_50", "EUW1_49"]], 2);
        let scan = scan_history(&src, Some(50), &bounds(100, 2)).await.unwrap();
        assert!(scan.matches.is_empty());
        assert_eq!(scan.newest_match, Some(50));
        assert_eq!(src.fetch_count(), 1);
    }

    #[tokio::test]
    async fn unparseable_page_head_leaves_watermark_unchanged() {
        // The watermark must stay "unchanged" (None), never a stand-in value.
        let src = StubSource::new(vec![vec!["garbage", "EUW1_40"]], 2);
        let scan = scan_history(&src, Some(40), &bounds(100, 2)).await.unwrap();
        assert!(scan.matches.is_empty());
        assert_eq!(scan.newest_match, None);
    }

    #[tokio::test]
    async fn duplicate_ids_across_pages_collapse() {
        // Page boundaries shift while paging; the same match can appear twice.
        let src = StubSource::new(
            vec![vec!["EUW1_10", "EUW1_9"], vec!["EUW1_9", "EUW1_8"], vec![]],
            2,
        );
        let scan = scan_history(&src, None, &bounds(100, 2)).await.unwrap();
        let ids: Vec<i64> = scan.matches.iter().map(|m| m.match_id).collect();
        assert_eq!(ids, vec![10, 9, 8]);
    }

    #[tokio::test]
    async fn cross_shard_ids_keep_their_own_platform() {
        let src = StubSource::new(vec![vec!["EUW1_5", "NA1_5"], vec![]], 2);
        let scan = scan_history(&src, None, &bounds(100, 2)).await.unwrap();
        assert_eq!(scan.matches[0].platform, "EUW1");
        assert_eq!(scan.matches[1].platform, "NA1");
    }

    #[test]
    fn match_id_parsing() {
        assert_eq!(split_match_id("EUW1_123"), Some(("EUW1", 123)));
        assert_eq!(split_match_id("_123"), None);
        assert_eq!(split_match_id("EUW1_x"), None);
        assert_eq!(split_match_id("no-separator"), None);
    }
}
