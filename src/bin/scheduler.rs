use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;
use tracing::info;

use relay_core::{QueueConfig, QueueScheduler, RedisStore, TaskQueue};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Redis URL
    #[arg(short, long, default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Namespace prefix for every key on the store
    #[arg(short, long, default_value = "queue")]
    key_prefix: String,

    /// Cadence of the due-task promotion sweep in milliseconds
    #[arg(long, default_value = "100")]
    poll_interval_ms: u64,

    /// Worker liveness window in milliseconds
    #[arg(long, default_value = "30000")]
    heartbeat_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Starting Relay Scheduler");

    let store = Arc::new(RedisStore::connect(&args.redis_url).await?);

    let config = QueueConfig {
        key_prefix: args.key_prefix,
        poll_interval_ms: args.poll_interval_ms,
        heartbeat_timeout_ms: args.heartbeat_timeout_ms,
        ..QueueConfig::default()
    };

    let queue = Arc::new(TaskQueue::new(store, config).await?);
    let scheduler = QueueScheduler::new(Arc::clone(&queue));
    scheduler.start();

    info!("Scheduler loops running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    scheduler.shutdown().await;
    queue.shutdown().await?;
    info!("Scheduler stopped");
    Ok(())
}
