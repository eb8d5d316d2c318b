use anyhow::Result;
use chrono::{TimeZone, Utc};
use sqlx::{Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::warn;

use crate::lifecycle::Lifecycle;
use crate::results::FlushBatch;
use crate::util::db::Db;

/// Atomic batch claim: select unresolved rows whose lock is absent or
/// expired, stamp a fresh lock, and return them in one round trip, skipping
/// rows a concurrent claimer already holds. Two callers can never receive
/// overlapping rows.
const CLAIM_SQL: &str = r#"
UPDATE ranking
SET "lock" = now() + make_interval(secs => $3)
WHERE platform = $1
  AND summoner_id IN (
      SELECT summoner_id
      FROM ranking
      WHERE platform = $1
        AND puuid IS NULL
        AND ("lock" IS NULL OR "lock" < now())
      LIMIT $2
      FOR UPDATE SKIP LOCKED
  )
RETURNING summoner_id, latest_match
"#;

#[derive(Debug, Clone)]
pub struct ClaimedRow {
    pub summoner_id: String,
    pub latest_match: Option<i64>,
}

/// Wraps the work table. The expiring lock is the only crash-recovery
/// mechanism: rows held by a dead claimer become claimable again after the
/// TTL with no heartbeat involved.
#[derive(Clone)]
pub struct ClaimStore {
    db: Db,
    lock_ttl_secs: i64,
}

impl ClaimStore {
    pub fn new(db: &Db, lock_ttl_secs: i64) -> Self {
        Self {
            db: db.clone(),
            lock_ttl_secs,
        }
    }

    /// Claim up to `max_count` rows. Store failures are retried in place
    /// with a fixed 1s delay; they never surface, and they are never
    /// conflated with "no work available" (an empty Vec is only returned by
    /// a successful query, or on shutdown).
    pub async fn claim(&self, platform: &str, max_count: i64, life: &Lifecycle) -> Vec<ClaimedRow> {
        loop {
            if life.is_shutdown() {
                return Vec::new();
            }
            match self.try_claim(platform, max_count).await {
                Ok(rows) => return rows,
                Err(e) => {
                    warn!(platform, error = %e, "claim failed; retrying");
                    life.sleep_unless_shutdown(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn try_claim(&self, platform: &str, max_count: i64) -> Result<Vec<ClaimedRow>> {
        let rows = sqlx::query(CLAIM_SQL)
            .bind(platform)
            .bind(max_count)
            .bind(self.lock_ttl_secs as f64)
            .fetch_all(&self.db.pool)
            .await?;
        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            claimed.push(ClaimedRow {
                summoner_id: row.try_get("summoner_id")?,
                latest_match: row.try_get("latest_match")?,
            });
        }
        Ok(claimed)
    }

    /// Apply one flushed batch in a single transaction: resolved rows get
    /// their puuid + watermark and drop their lock, summoners are upserted,
    /// discovered matches are inserted per destination shard, and 404'd rows
    /// are deleted. Every statement is idempotent, so replaying a batch after
    /// a redelivery converges to the same state.
    pub async fn write_back(&self, platform: &str, batch: &FlushBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.db.pool.begin().await?;

        for r in &batch.resolved {
            sqlx::query(
                r#"UPDATE ranking
                   SET puuid = $3,
                       latest_match = COALESCE($4, latest_match),
                       "lock" = NULL
                   WHERE platform = $1 AND summoner_id = $2"#,
            )
            .bind(platform)
            .bind(&r.summoner_id)
            .bind(&r.puuid)
            .bind(r.newest_match)
            .execute(&mut *tx)
            .await?;
        }

        if !batch.resolved.is_empty() {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO summoner (puuid, name, last_activity, platform) ");
            qb.push_values(batch.resolved.iter(), |mut b, r| {
                let last_activity = r
                    .revision_ms
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
                b.push_bind(r.puuid.as_str())
                    .push_bind(r.name.as_deref())
                    .push_bind(last_activity)
                    .push_bind(platform);
            });
            qb.push(" ON CONFLICT (puuid) DO NOTHING");
            qb.build().execute(&mut *tx).await?;
        }

        for (shard, matches) in &batch.matches_by_shard {
            if matches.is_empty() {
                continue;
            }
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(r#"INSERT INTO "match" (platform, match_id, queue_type) "#);
            qb.push_values(matches.iter(), |mut b, m| {
                b.push_bind(shard.as_str())
                    .push_bind(m.match_id)
                    .push_bind(m.queue_type);
            });
            qb.push(" ON CONFLICT (platform, match_id) DO NOTHING");
            qb.build().execute(&mut *tx).await?;
        }

        if !batch.not_found.is_empty() {
            sqlx::query("DELETE FROM ranking WHERE platform = $1 AND summoner_id = ANY($2)")
                .bind(platform)
                .bind(&batch.not_found)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The concurrency properties live in the query shape: eligibility is
    // "unresolved and unlocked-or-expired", contended rows are skipped, and
    // the lock stamp + select happen in one statement.
    #[test]
    fn claim_query_shape() {
        assert!(CLAIM_SQL.contains("FOR UPDATE SKIP LOCKED"));
        assert!(CLAIM_SQL.contains("puuid IS NULL"));
        assert!(CLAIM_SQL.contains(r#""lock" IS NULL OR "lock" < now()"#));
        assert!(CLAIM_SQL.contains("RETURNING summoner_id, latest_match"));
        assert!(CLAIM_SQL.trim_start().starts_with("UPDATE ranking"));
    }
}
