use job_queue_broker::{JobQueue, WorkerRegistry};
use job_queue_persistence::{JobStore, JobStoreConfig};
use job_queue_worker::{CommandExecutor, ShellExecutor, Worker, WorkerConfig, WorkerStats};

use clap::Parser;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "jobq-worker")]
#[command(about = "Job Queue Worker", long_about = None)]
struct Args {
    /// Data directory of the job store
    #[arg(long, env = "JOBQ_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Number of workers to run in this process
    #[arg(short, long)]
    count: Option<usize>,

    /// Milliseconds between polls when idle
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        WorkerConfig::from_file(config_path)?
    } else {
        WorkerConfig::default()
    };

    // Override with CLI args
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(worker_id) = args.worker_id {
        config.worker_id = Some(worker_id);
    }
    if let Some(count) = args.count {
        config.count = count;
    }
    if let Some(poll_interval_ms) = args.poll_interval_ms {
        config.poll_interval_ms = poll_interval_ms;
    }
    if config.count == 0 {
        anyhow::bail!("count must be at least 1");
    }

    let store = Arc::new(JobStore::open(JobStoreConfig::new(&config.data_dir))?);
    let queue = JobQueue::new(store.clone());
    let registry = WorkerRegistry::new(store);

    let alive = registry.list()?;
    tracing::info!("{} other worker(s) already running", alive.len());

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let base_id = config.generate_worker_id();
    let executor: Arc<dyn CommandExecutor> = Arc::new(ShellExecutor::new());
    let poll_interval = Duration::from_millis(config.poll_interval_ms);

    let mut workers = JoinSet::new();
    let mut stats_handles = Vec::with_capacity(config.count);
    for index in 0..config.count {
        let worker = Worker::new(
            config.worker_id_for(&base_id, index),
            queue.clone(),
            registry.clone(),
            executor.clone(),
            poll_interval,
            shutdown.child_token(),
        );
        stats_handles.push(worker.stats_handle());
        workers.spawn(async move {
            if let Err(e) = worker.run().await {
                tracing::error!("Worker {} exited with error: {}", worker.id(), e);
            }
        });
    }
    tracing::info!("Started {} worker(s) on {:?}", config.count, config.data_dir);

    let summary_stop = CancellationToken::new();
    let summary = tokio::spawn(report_progress(
        stats_handles.clone(),
        Duration::from_secs(config.summary_interval_secs.max(1)),
        summary_stop.clone(),
    ));

    while workers.join_next().await.is_some() {}
    summary_stop.cancel();
    let _ = summary.await;

    let totals = total_stats(&stats_handles);
    tracing::info!(
        "All workers stopped: {} processed, {} succeeded, {} failed, {} dead-lettered",
        totals.processed,
        totals.succeeded,
        totals.failed,
        totals.dead_lettered
    );

    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        tracing::info!("Received shutdown signal, finishing current jobs");
        shutdown.cancel();
    });
    Ok(())
}

async fn report_progress(
    handles: Vec<Arc<RwLock<WorkerStats>>>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    let mut last_processed = 0;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                let totals = total_stats(&handles);
                if totals.processed != last_processed {
                    tracing::info!(
                        "Progress: {} processed, {} succeeded, {} failed",
                        totals.processed, totals.succeeded, totals.failed
                    );
                    last_processed = totals.processed;
                }
            }
        }
    }
}

fn total_stats(handles: &[Arc<RwLock<WorkerStats>>]) -> WorkerStats {
    let mut totals = WorkerStats::default();
    for handle in handles {
        totals.merge(&handle.read());
    }
    totals
}
