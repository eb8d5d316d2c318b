use anyhow::Result;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::Row;
use tokio_postgres::{AsyncMessage, NoTls};
use tracing::warn;

use crate::util::db::Db;

/// One PGMQ queue. The broker contract the pipeline relies on:
/// reads lease a message for `vt` seconds (in-flight), `ack` removes it,
/// `reject_requeue` makes it deliverable again, `reject_drop` archives it
/// (poison messages), and `depth` reports the backlog length.
#[derive(Clone)]
pub struct PgmqQueue {
    db: Db,
    name: String,
}

/// A leased message. Redelivery count comes back with it so callers can
/// escalate repeatedly failing messages.
#[derive(Debug)]
pub struct Delivery<T> {
    pub msg_id: i64,
    pub read_ct: i32,
    pub body: T,
}

impl PgmqQueue {
    pub fn new(db: &Db, name: impl Into<String>) -> Self {
        Self {
            db: db.clone(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the queue when missing. pgmq's create() is not idempotent when
    /// the backing relations already belong to the extension, so probe first.
    pub async fn ensure(&self) -> Result<()> {
        let q_name = format!("q_{}", self.name);
        let a_name = format!("a_{}", self.name);
        let exists: bool = sqlx::query_scalar(
            "select exists (
                 select 1 from pg_class c
                 join pg_namespace n on n.oid = c.relnamespace
                 where c.relkind = 'r' and c.relname = $1
             ) or exists (
                 select 1 from pg_class c
                 join pg_namespace n on n.oid = c.relnamespace
                 where c.relkind = 'r' and c.relname = $2
             )",
        )
        .bind(&q_name)
        .bind(&a_name)
        .fetch_one(&self.db.pool)
        .await?;

        if !exists {
            sqlx::query("SELECT pgmq.\"create\"($1)")
                .bind(&self.name)
                .execute(&self.db.pool)
                .await?;
        }
        Ok(())
    }

    /// Publish a batch in one round trip. PGMQ messages are table-backed, so
    /// this is durable by construction.
    pub async fn send_batch<T: Serialize>(&self, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let payloads: Vec<String> = items
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<_, _>>()?;
        sqlx::query("SELECT pgmq.send_batch($1, $2::text[]::jsonb[])")
            .bind(&self.name)
            .bind(&payloads)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    pub async fn send<T: Serialize>(&self, item: &T) -> Result<i64> {
        let payload = serde_json::to_value(item)?;
        let row = sqlx::query("SELECT pgmq.send($1, $2) AS msg_id")
            .bind(&self.name)
            .bind(sqlx::types::Json(payload))
            .fetch_one(&self.db.pool)
            .await?;
        let msg_id: i64 = row.try_get("msg_id").unwrap_or_default();
        Ok(msg_id)
    }

    /// Lease the next message for `vt_secs`. A payload that does not decode
    /// is archived on the spot (poison message) and reported as no-message.
    pub async fn read_one<T: DeserializeOwned>(&self, vt_secs: i32) -> Result<Option<Delivery<T>>> {
        let row = sqlx::query("SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, 1)")
            .bind(&self.name)
            .bind(vt_secs)
            .fetch_optional(&self.db.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let msg_id: i64 = row.try_get("msg_id")?;
        let read_ct: i32 = row.try_get("read_ct")?;
        let message: serde_json::Value = row.try_get("message")?;
        match serde_json::from_value::<T>(message) {
            Ok(body) => Ok(Some(Delivery {
                msg_id,
                read_ct,
                body,
            })),
            Err(e) => {
                warn!(queue = %self.name, msg_id, error = %e, "bad payload; archiving");
                self.reject_drop(msg_id).await?;
                Ok(None)
            }
        }
    }

    /// Permanently remove a processed message.
    pub async fn ack(&self, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(&self.name)
            .bind(msg_id)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    /// Make the message deliverable again after `delay_secs`.
    pub async fn reject_requeue(&self, msg_id: i64, delay_secs: i32) -> Result<()> {
        sqlx::query("SELECT pgmq.set_vt($1, $2, $3)")
            .persistent(false)
            .bind(&self.name)
            .bind(msg_id)
            .bind(delay_secs)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    /// Drop without redelivery; the archive table keeps it for post-mortems.
    pub async fn reject_drop(&self, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(&self.name)
            .bind(msg_id)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    /// Current queue depth (visible + leased), used by the backlog gate.
    pub async fn depth(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT queue_length FROM pgmq.metrics($1)")
            .bind(&self.name)
            .fetch_one(&self.db.pool)
            .await?;
        Ok(n)
    }

    /// Nudge idle consumers; the queue name doubles as the NOTIFY channel.
    pub async fn notify(&self) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.name)
            .bind(self.name.as_str())
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }
}

/// Dedicated LISTEN connection feeding notifications into a channel. Kept
/// separate from the sqlx pool: transaction-mode poolers cannot carry LISTEN.
pub async fn listen(
    url: &str,
    channels: Vec<String>,
) -> Result<tokio::sync::mpsc::UnboundedReceiver<String>> {
    let (client, mut connection) = tokio_postgres::connect(url, NoTls).await?;
    for ch in &channels {
        client.batch_execute(&format!("LISTEN {}", ch)).await?;
    }
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let channel_set: std::collections::HashSet<String> = channels.into_iter().collect();
    tokio::spawn(async move {
        let _client = client;
        let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(n)) => {
                    if channel_set.contains(n.channel())
                        && tx.send(n.channel().to_string()).is_err()
                    {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "listen connection lost");
                    break;
                }
            }
        }
    });
    Ok(rx)
}
