//! DripFlow — trigger-driven marketing automation workflow engine.
//!
//! Main entry point that assembles the queue, worker pool, execution
//! engine, trigger listener, and A/B test engine once at process start.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use dripflow_abtest::engine::SweepHandler;
use dripflow_abtest::{AbTestEngine, EngagementTracker};
use dripflow_core::collaborators::{noop_sender, InMemorySubscriberStore};
use dripflow_core::config::AppConfig;
use dripflow_core::event_bus::InProcessEventBus;
use dripflow_engine::{ExecutionEngine, StepEvaluator, TriggerListener};
use dripflow_engine::engine::StepExecutionHandler;
use dripflow_queue::{JobQueue, MemoryJobQueue, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "dripflow")]
#[command(about = "Trigger-driven marketing automation workflow engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "DRIPFLOW__NODE_ID")]
    node_id: Option<String>,

    /// Jobs pulled per batch (overrides config)
    #[arg(long, env = "DRIPFLOW__WORKER__BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Concurrent jobs per batch (overrides config)
    #[arg(long, env = "DRIPFLOW__WORKER__CONCURRENCY")]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dripflow=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("DripFlow starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(batch_size) = cli.batch_size {
        config.worker.batch_size = batch_size;
    }
    if let Some(concurrency) = cli.concurrency {
        config.worker.concurrency = concurrency;
    }

    info!(
        node_id = %config.node_id,
        batch_size = config.worker.batch_size,
        concurrency = config.worker.concurrency,
        sweep_interval_secs = config.abtest.sweep_interval_secs,
        "Configuration loaded"
    );

    // Queue and collaborators. The subscriber store and message transport
    // live elsewhere in the platform; the in-memory store and no-op sender
    // stand in for single-node deployments.
    let queue: Arc<MemoryJobQueue> = Arc::new(MemoryJobQueue::new(
        Duration::from_millis(config.worker.retry_delay_ms),
        Duration::from_secs(config.queue.retention_secs),
    ));
    let subscribers = Arc::new(InMemorySubscriberStore::new());
    let sender = noop_sender();
    let abtests = Arc::new(AbTestEngine::new());

    // Execution engine and trigger listener.
    let evaluator = StepEvaluator::new(sender, subscribers.clone(), abtests.clone());
    let engine = Arc::new(ExecutionEngine::new(
        evaluator,
        queue.clone(),
        config.engine.clone(),
    ));
    let listener = TriggerListener::new(engine.clone(), subscribers, queue.clone());

    let bus = InProcessEventBus::new();
    listener.attach(&bus);
    EngagementTracker::new(abtests.clone()).attach(&bus);

    // Worker pool with one handler per job kind.
    let sweep = Arc::new(SweepHandler::new(
        abtests.clone(),
        queue.clone() as Arc<dyn JobQueue>,
        config.abtest.sweep_interval_secs,
    ));
    sweep.schedule_first()?;

    let mut pool = WorkerPool::new(queue.clone(), config.worker.clone());
    pool.register(Arc::new(StepExecutionHandler::new(engine.clone())));
    pool.register(listener.clone());
    pool.register(sweep);
    let pool = Arc::new(pool);
    let pool_task = pool.spawn();

    // Periodic retention sweep over terminal jobs and trigger dedup keys.
    let queue_for_sweep = queue.clone();
    let dedup_retention = Duration::from_secs(config.queue.retention_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            queue_for_sweep.sweep_expired();
            listener.sweep_expired(dedup_retention);
        }
    });

    info!("DripFlow is ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    pool.shutdown();
    let _ = pool_task.await;

    Ok(())
}
