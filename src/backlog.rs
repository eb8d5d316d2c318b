use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::claim::{ClaimStore, ClaimedRow};
use crate::lifecycle::SharedLifecycle;
use crate::queue::PgmqQueue;

/// Task-queue wire format: everything a fetch worker needs to build the
/// upstream requests without touching the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestTask {
    pub summoner_id: String,
    pub platform: String,
    /// Pagination sentinel from the previous pass, if any.
    pub latest_match: Option<i64>,
    pub enqueued_at: DateTime<Utc>,
}

/// Sliding memory of recently queued identifiers, bounded at
/// `sections × section_size`. Its only job is to keep the gate from
/// re-queueing rows that are still sitting unconsumed in the queue; it is
/// trimmed oldest-first as the queue drains.
#[derive(Debug)]
pub struct SectionMemory {
    sections: usize,
    section_size: usize,
    order: VecDeque<String>,
    index: HashSet<String>,
}

impl SectionMemory {
    pub fn new(sections: usize, section_size: usize) -> Self {
        Self {
            sections,
            section_size,
            order: VecDeque::with_capacity(sections * section_size),
            index: HashSet::with_capacity(sections * section_size),
        }
    }

    pub fn section_size(&self) -> usize {
        self.section_size
    }

    pub fn capacity(&self) -> usize {
        self.sections * self.section_size
    }

    /// Queue depth the gate waits under before admitting more work.
    pub fn high_water(&self) -> i64 {
        ((self.sections - 1) * self.section_size) as i64
    }

    pub fn claim_batch(&self) -> i64 {
        self.capacity() as i64
    }

    pub fn remembered(&self) -> usize {
        self.order.len()
    }

    /// Drop everything but the newest `remaining_sections` worth of ids.
    pub fn trim_to_sections(&mut self, remaining_sections: usize) {
        let keep = (remaining_sections * self.section_size).min(self.capacity());
        while self.order.len() > keep {
            if let Some(old) = self.order.pop_front() {
                self.index.remove(&old);
            }
        }
    }

    /// Rows not currently remembered, capped so memory never exceeds its
    /// bound after they are admitted.
    pub fn filter_fresh(&self, rows: Vec<ClaimedRow>) -> Vec<ClaimedRow> {
        let room = self.capacity().saturating_sub(self.order.len());
        rows.into_iter()
            .filter(|r| !self.index.contains(&r.summoner_id))
            .take(room)
            .collect()
    }

    pub fn remember(&mut self, rows: &[ClaimedRow]) {
        for r in rows {
            if self.index.insert(r.summoner_id.clone()) {
                self.order.push_back(r.summoner_id.clone());
            }
        }
    }
}

/// Admission control in front of the task queue. Blocks until the queue has
/// drained below the high-water mark, then claims a batch, filters out ids
/// still queued, and publishes the remainder as one durable batch.
pub struct BacklogGate {
    platform: String,
    claim: ClaimStore,
    tasks: PgmqQueue,
    memory: SectionMemory,
    life: SharedLifecycle,
    poll: Duration,
    starve: Duration,
}

impl BacklogGate {
    pub fn new(
        platform: String,
        claim: ClaimStore,
        tasks: PgmqQueue,
        memory: SectionMemory,
        life: SharedLifecycle,
        poll_secs: u64,
        starve_secs: u64,
    ) -> Self {
        Self {
            platform,
            claim,
            tasks,
            memory,
            life,
            poll: Duration::from_secs(poll_secs),
            starve: Duration::from_secs(starve_secs),
        }
    }

    pub async fn run(mut self) {
        info!(platform = %self.platform, "backlog gate up");
        'outer: while !self.life.is_shutdown() {
            // Cooperative depth wait: producers stall here, not the broker.
            let depth = loop {
                if self.life.is_shutdown() {
                    break 'outer;
                }
                match self.tasks.depth().await {
                    Ok(d) if d <= self.memory.high_water() => break d,
                    Ok(_) => {
                        self.life.sleep_unless_shutdown(self.poll).await;
                    }
                    Err(e) => {
                        warn!(platform = %self.platform, error = %e, "depth check failed");
                        self.life
                            .sleep_unless_shutdown(Duration::from_secs(1))
                            .await;
                    }
                }
            };

            let remaining = (depth as usize).div_ceil(self.memory.section_size());
            self.memory.trim_to_sections(remaining);

            loop {
                if self.life.is_shutdown() {
                    break 'outer;
                }
                let rows = self
                    .claim
                    .claim(&self.platform, self.memory.claim_batch(), &self.life)
                    .await;
                let fresh = self.memory.filter_fresh(rows);
                if fresh.is_empty() {
                    // Store starved while the queue drains: normal
                    // steady-state, not an error.
                    if self.life.sleep_unless_shutdown(self.starve).await {
                        break 'outer;
                    }
                    continue;
                }
                let now = Utc::now();
                let msgs: Vec<HarvestTask> = fresh
                    .iter()
                    .map(|r| HarvestTask {
                        summoner_id: r.summoner_id.clone(),
                        platform: self.platform.clone(),
                        latest_match: r.latest_match,
                        enqueued_at: now,
                    })
                    .collect();
                match self.tasks.send_batch(&msgs).await {
                    Ok(()) => {
                        // Remember only after a successful publish; rows that
                        // failed to publish stay claimable once their lock
                        // expires.
                        self.memory.remember(&fresh);
                        if let Err(e) = self.tasks.notify().await {
                            debug!(platform = %self.platform, error = %e, "task notify failed");
                        }
                        info!(platform = %self.platform, admitted = fresh.len(), "admitted tasks");
                        break;
                    }
                    Err(e) => {
                        warn!(platform = %self.platform, error = %e, "task publish failed");
                        self.life
                            .sleep_unless_shutdown(Duration::from_secs(1))
                            .await;
                    }
                }
            }
        }
        debug!(platform = %self.platform, "backlog gate stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(ids: &[&str]) -> Vec<ClaimedRow> {
        ids.iter()
            .map(|id| ClaimedRow {
                summoner_id: id.to_string(),
                latest_match: None,
            })
            .collect()
    }

    #[test]
    fn trim_drops_oldest_first() {
        let mut mem = SectionMemory::new(3, 2);
        mem.remember(&rows(&["a", "b", "c", "d", "e", "f"]));
        mem.trim_to_sections(2);
        assert_eq!(mem.remembered(), 4);
        // Oldest two are gone, so they are admissible again.
        let fresh = mem.filter_fresh(rows(&["a", "b", "e", "f"]));
        let ids: Vec<_> = fresh.iter().map(|r| r.summoner_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn filter_skips_still_queued_ids() {
        let mut mem = SectionMemory::new(2, 4);
        mem.remember(&rows(&["a", "b"]));
        let fresh = mem.filter_fresh(rows(&["a", "b", "c"]));
        let ids: Vec<_> = fresh.iter().map(|r| r.summoner_id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[test]
    fn memory_never_exceeds_section_bound() {
        let mut mem = SectionMemory::new(2, 3);
        let fresh = mem.filter_fresh(rows(&["a", "b", "c", "d", "e", "f", "g", "h"]));
        assert_eq!(fresh.len(), 6);
        mem.remember(&fresh);
        assert_eq!(mem.remembered(), mem.capacity());
        // Full memory admits nothing further.
        assert!(mem.filter_fresh(rows(&["x"])).is_empty());
    }

    #[test]
    fn high_water_leaves_one_section_of_headroom() {
        let mem = SectionMemory::new(8, 1000);
        assert_eq!(mem.high_water(), 7000);
        assert_eq!(mem.claim_batch(), 8000);
    }
}
