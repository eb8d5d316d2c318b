use anyhow::Result;
use clap::Parser;

use riftline::config::HarvestConfig;
use riftline::platform::{result_queue_name, task_queue_name};
use riftline::queue::PgmqQueue;
use riftline::util::db::Db;
use riftline::util::env as env_util;

#[derive(Parser, Debug)]
#[clap(version, about = "Create harvest tables and per-platform queues")]
struct Args {
    /// Only print what would be created.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    let args = Args::parse();
    riftline::logging::init_tracing("info")?;

    let cfg = HarvestConfig::from_env();
    if args.dry_run {
        for platform in &cfg.platforms {
            println!(
                "would ensure queues {} and {}",
                task_queue_name(platform),
                result_queue_name(platform)
            );
        }
        println!("would ensure tables ranking, summoner, \"match\"");
        return Ok(());
    }

    let database_url = env_util::db_url()?;
    let db = Db::connect(&database_url, 5).await?;
    db.ensure_schema().await?;

    for platform in &cfg.platforms {
        PgmqQueue::new(&db, task_queue_name(platform)).ensure().await?;
        PgmqQueue::new(&db, result_queue_name(platform)).ensure().await?;
        tracing::info!(platform = %platform, "queues ensured");
    }
    Ok(())
}
