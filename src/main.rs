use anyhow::Result;
use clap::Parser;
use itinerary_notify::clock::{Clock, SystemClock};
use itinerary_notify::config;
use itinerary_notify::db;
use itinerary_notify::notifier::Notifier;
use itinerary_notify::queue::SqliteQueue;
use itinerary_notify::scheduler::{Scheduler, SchedulerSettings};
use itinerary_notify::sender::{LogSender, Sender, WebhookSender};
use itinerary_notify::worker::Worker;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sender: Arc<dyn Sender> = match &cfg.delivery.webhook_url {
        Some(url) => Arc::new(WebhookSender::new(url)?),
        None => Arc::new(LogSender),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_handle = None;
    let notifier = if cfg.queue.enabled {
        let queue = Arc::new(SqliteQueue::new(pool.clone(), clock.clone()));
        // A queued reminder is stale once the next event scan would have run.
        let expire_after =
            chrono::Duration::seconds(cfg.scheduler.event_reminder_interval_secs as i64);
        let worker = Worker::new(
            pool.clone(),
            sender.clone(),
            clock.clone(),
            cfg.queue.poll_interval(),
            cfg.queue.max_backoff_seconds as i64,
        );
        worker_handle = Some(tokio::spawn(worker.run(shutdown_rx)));
        Notifier::queued(pool.clone(), clock.clone(), sender, queue, expire_after)
    } else {
        Notifier::inline(pool.clone(), clock.clone(), sender)
    };

    let settings = SchedulerSettings::from_config(&cfg.scheduler)?;
    let scheduler = Scheduler::new(pool.clone(), notifier, clock, settings);
    scheduler.start();
    info!(queued = cfg.queue.enabled, "notification service running");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(?err, "failed to listen for shutdown signal");
    }

    info!("shutting down");
    scheduler.stop().await;
    let _ = shutdown_tx.send(true);
    if let Some(handle) = worker_handle {
        if let Err(err) = handle.await {
            error!(?err, "batch worker task failed");
        }
    }
    pool.close().await;
    Ok(())
}
