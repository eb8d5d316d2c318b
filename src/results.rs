use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::claim::ClaimStore;
use crate::lifecycle::SharedLifecycle;
use crate::queue::PgmqQueue;

/// A match discovered while paging a player's history. The match may live on
/// a different shard than the player that surfaced it, so it carries its own
/// platform. Value equality is what dedup keys on: the same match seen
/// through two pages (or two players) collapses to one row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MatchRef {
    pub platform: String,
    pub match_id: i64,
    pub queue_type: Option<i32>,
}

/// Terminal outcome of resolving one player. `newest_match: None` means the
/// pagination watermark is unchanged from the previous pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResolvedSummoner {
    pub summoner_id: String,
    pub puuid: String,
    pub name: Option<String>,
    pub revision_ms: Option<i64>,
    pub newest_match: Option<i64>,
}

/// Wire format on the results queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultRecord {
    Found(ResolvedSummoner),
    NotFound { summoner_id: String },
    Match(MatchRef),
}

/// One flush unit handed to the claim store: resolved updates, deletes, and
/// matches grouped by their destination shard.
#[derive(Debug, Default)]
pub struct FlushBatch {
    pub resolved: Vec<ResolvedSummoner>,
    pub not_found: Vec<String>,
    pub matches_by_shard: BTreeMap<String, Vec<MatchRef>>,
}

impl FlushBatch {
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty() && self.not_found.is_empty() && self.matches_by_shard.is_empty()
    }
}

/// Split a drained buffer into its write-back shape. Matches are deduplicated
/// by full value equality before grouping.
pub fn partition(records: &[ResultRecord]) -> FlushBatch {
    let mut batch = FlushBatch::default();
    let mut seen_matches: HashSet<&MatchRef> = HashSet::new();
    for record in records {
        match record {
            ResultRecord::Found(r) => batch.resolved.push(r.clone()),
            ResultRecord::NotFound { summoner_id } => batch.not_found.push(summoner_id.clone()),
            ResultRecord::Match(m) => {
                if seen_matches.insert(m) {
                    batch
                        .matches_by_shard
                        .entry(m.platform.clone())
                        .or_default()
                        .push(m.clone());
                }
            }
        }
    }
    batch
}

/// Accumulates result messages in memory and flushes them on a cadence as a
/// single idempotent unit of work. The buffer is only ever touched by this
/// task; flushes swap it out rather than mutating in place.
pub struct ResultBatcher {
    queue: PgmqQueue,
    claim: ClaimStore,
    platform: String,
    wake: Arc<Notify>,
    life: SharedLifecycle,
    flush_secs: u64,
    vt_secs: i32,
    poll_secs: u64,
    buffer: Vec<ResultRecord>,
}

enum Event {
    Tick,
    Read(anyhow::Result<Option<crate::queue::Delivery<ResultRecord>>>),
    Stop,
}

impl ResultBatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: PgmqQueue,
        claim: ClaimStore,
        platform: String,
        wake: Arc<Notify>,
        life: SharedLifecycle,
        flush_secs: u64,
        vt_secs: i32,
        poll_secs: u64,
    ) -> Self {
        Self {
            queue,
            claim,
            platform,
            wake,
            life,
            flush_secs,
            vt_secs,
            poll_secs,
            buffer: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        let life = self.life.clone();
        let wake = self.wake.clone();
        let mut tick = interval(Duration::from_secs(self.flush_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !life.is_shutdown() {
            let event = tokio::select! {
                _ = tick.tick() => Event::Tick,
                res = self.queue.read_one::<ResultRecord>(self.vt_secs) => Event::Read(res),
                _ = life.wait_shutdown() => Event::Stop,
            };
            match event {
                Event::Stop => break,
                Event::Tick => self.flush().await,
                Event::Read(Ok(Some(delivery))) => {
                    self.buffer.push(delivery.body);
                    if let Err(e) = self.queue.ack(delivery.msg_id).await {
                        // Redelivery just produces a duplicate record; the
                        // write-back is idempotent.
                        warn!(platform = %self.platform, error = %e, "result ack failed");
                    }
                }
                Event::Read(Ok(None)) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(self.poll_secs)) => {}
                        _ = wake.notified() => {}
                        _ = life.wait_shutdown() => {}
                    }
                }
                Event::Read(Err(e)) => {
                    warn!(platform = %self.platform, error = %e, "result read failed");
                    life.sleep_unless_shutdown(Duration::from_secs(1)).await;
                }
            }
        }

        // Final drain flush.
        self.flush().await;
        debug!(platform = %self.platform, "result batcher stopped");
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let records = std::mem::take(&mut self.buffer);
        let batch = partition(&records);
        match self.claim.write_back(&self.platform, &batch).await {
            Ok(()) => {
                info!(
                    platform = %self.platform,
                    resolved = batch.resolved.len(),
                    not_found = batch.not_found.len(),
                    shards = batch.matches_by_shard.len(),
                    "flushed results"
                );
            }
            Err(e) => {
                warn!(platform = %self.platform, error = %e, "flush failed; retrying next tick");
                // Keep the drained records in front of anything buffered since.
                let mut restored = records;
                restored.append(&mut self.buffer);
                self.buffer = restored;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mref(platform: &str, id: i64) -> ResultRecord {
        ResultRecord::Match(MatchRef {
            platform: platform.into(),
            match_id: id,
            queue_type: Some(420),
        })
    }

    #[test]
    fn partitions_matches_by_their_own_shard() {
        let records = vec![
            mref("EUW1", 10),
            mref("NA1", 11),
            mref("EUW1", 12),
            ResultRecord::NotFound {
                summoner_id: "gone".into(),
            },
        ];
        let batch = partition(&records);
        assert_eq!(batch.matches_by_shard["EUW1"].len(), 2);
        assert_eq!(batch.matches_by_shard["NA1"].len(), 1);
        assert_eq!(batch.not_found, vec!["gone".to_string()]);
    }

    #[test]
    fn duplicate_matches_collapse_by_value() {
        // The same match legitimately shows up through multiple pages.
        let records = vec![mref("EUW1", 10), mref("EUW1", 10), mref("EUW1", 10)];
        let batch = partition(&records);
        assert_eq!(batch.matches_by_shard["EUW1"].len(), 1);
    }

    #[test]
    fn same_match_id_on_other_shard_is_distinct() {
        let records = vec![mref("EUW1", 10), mref("NA1", 10)];
        let batch = partition(&records);
        assert_eq!(batch.matches_by_shard.len(), 2);
    }

    #[test]
    fn result_wire_tags_are_stable() {
        let v = serde_json::to_value(mref("EUW1", 7)).unwrap();
        assert_eq!(v["kind"], "match");
        let v = serde_json::to_value(ResultRecord::NotFound {
            summoner_id: "s".into(),
        })
        .unwrap();
        assert_eq!(v["kind"], "not_found");
        let v = serde_json::to_value(ResultRecord::Found(ResolvedSummoner {
            summoner_id: "s".into(),
            puuid: "p".into(),
            name: None,
            revision_ms: None,
            newest_match: None,
        }))
        .unwrap();
        assert_eq!(v["kind"], "found");
    }
}
