use anyhow::Result;
use clap::Parser;

use riftline::config::{parse_platform_list, HarvestConfig};
use riftline::lifecycle::{spawn_signal_handler, Lifecycle};
use riftline::platform::{run_platform, PlatformContext};
use riftline::util::db::Db;
use riftline::util::env as env_util;

#[derive(Parser, Debug)]
#[clap(version, about = "Per-platform harvest pipelines: claim, fetch, persist")]
struct Args {
    /// Comma-separated platform shards; overrides HARVEST_PLATFORMS.
    #[arg(short = 'p', long = "platforms")]
    platforms: Option<String>,

    /// Log verbosely regardless of RUST_LOG.
    #[arg(short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    let args = Args::parse();
    riftline::logging::init_tracing(if args.verbose { "debug" } else { "info" })?;

    let mut cfg = HarvestConfig::from_env();
    if let Some(raw) = &args.platforms {
        let parsed = parse_platform_list(raw);
        if !parsed.is_empty() {
            cfg.platforms = parsed;
        }
    }

    let database_url = env_util::db_url()?;
    let db = Db::connect(&database_url, cfg.max_connections).await?;
    if env_util::env_flag("AUTO_MIGRATE", false) {
        db.ensure_schema().await?;
    }

    let life = Lifecycle::new();
    spawn_signal_handler(life.clone());

    tracing::info!(
        platforms = %cfg.platforms.join(","),
        sections = cfg.sections,
        section_size = cfg.section_size,
        workers = cfg.worker_ceiling,
        "harvester starting"
    );

    let mut pipelines = Vec::with_capacity(cfg.platforms.len());
    for platform in &cfg.platforms {
        let ctx = PlatformContext::new(platform, cfg.clone(), db.clone(), life.clone())?;
        pipelines.push(tokio::spawn(run_platform(ctx)));
    }

    let mut first_err: Option<anyhow::Error> = None;
    for handle in pipelines {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "pipeline failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            Err(join_err) => {
                if first_err.is_none() {
                    first_err = Some(anyhow::anyhow!(join_err));
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
