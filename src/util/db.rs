use anyhow::Result;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let use_prepared = crate::util::env::env_flag("USE_PREPARED", false);
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        // Be explicit about TLS when the DSN demands it; sqlx honors the DSN
        // but mixed pooler setups have bitten before.
        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !use_prepared {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!("connected to db");
        Ok(Self { pool })
    }

    /// Create the harvest tables when they are missing. Gated behind
    /// AUTO_MIGRATE in the pipeline binary; the db_migrate bin calls it
    /// unconditionally.
    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS ranking (
                platform     TEXT NOT NULL,
                summoner_id  TEXT NOT NULL,
                puuid        TEXT,
                latest_match BIGINT,
                "lock"       TIMESTAMPTZ,
                PRIMARY KEY (platform, summoner_id)
            )"#,
            r#"CREATE INDEX IF NOT EXISTS ranking_unresolved_idx
                ON ranking (platform, summoner_id)
                WHERE puuid IS NULL"#,
            r#"CREATE TABLE IF NOT EXISTS summoner (
                puuid         TEXT PRIMARY KEY,
                name          TEXT,
                last_activity TIMESTAMPTZ,
                platform      TEXT NOT NULL,
                last_updated  TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
            r#"CREATE TABLE IF NOT EXISTS "match" (
                platform      TEXT NOT NULL,
                match_id      BIGINT NOT NULL,
                queue_type    INT,
                discovered_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (platform, match_id)
            )"#,
        ];
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        info!("schema ensured");
        Ok(())
    }
}
