use clap::Parser;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use task_queue_core::{Priority, TaskSpec, TaskStatus};
use task_queue_engine::{BroadcastPublisher, Engine, EngineConfig, HandlerRegistry, MemoryStorage};
use task_queue_worker::handler::register_builtin;
use task_queue_worker::{Worker, WorkerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tq-worker")]
#[command(about = "Task Queue demo worker over an in-process engine", long_about = None)]
struct Args {
    /// Engine configuration file (YAML)
    #[arg(long)]
    config: Option<String>,

    /// Worker configuration file (YAML)
    #[arg(long)]
    worker_config: Option<String>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Number of logical workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Demo tasks to submit
    #[arg(short, long, default_value = "20")]
    tasks: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let engine_config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| engine_config.monitoring.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut worker_config = match &args.worker_config {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(workers) = args.workers {
        worker_config.concurrency = workers;
    }
    if let Some(worker_id) = args.worker_id {
        worker_config.worker_id = Some(worker_id);
    }

    let handlers = Arc::new(HandlerRegistry::new());
    register_builtin(&handlers);
    tracing::info!("Registered task names: {:?}", handlers.registered_handlers());

    let engine = Arc::new(Engine::new(
        engine_config,
        Arc::new(MemoryStorage::new()),
        Arc::new(BroadcastPublisher::default()),
        handlers,
    )?);
    let maintenance = engine.clone().start();

    submit_demo_tasks(&engine, args.tasks).await?;

    let worker = Arc::new(Worker::new(engine.clone(), worker_config.clone()));
    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    // Handle shutdown signals
    let shutdown = worker.shutdown_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal");
        shutdown.cancel();
    });

    let shutdown = worker.shutdown_token();
    tokio::select! {
        result = wait_until_idle(&engine, &worker_config.queues) => result?,
        _ = shutdown.cancelled() => {}
    }

    worker.shutdown();
    runner.await??;
    engine.shutdown();
    maintenance.await?;

    print_summary(&engine).await
}

async fn submit_demo_tasks(engine: &Engine, count: usize) -> anyhow::Result<()> {
    for n in 0..count {
        let pick = rand::thread_rng().gen_range(0..Priority::DESCENDING.len());
        let priority = Priority::DESCENDING[pick];
        let spec = match n % 4 {
            0 => TaskSpec::new("echo", format!("message {}", n).into_bytes()),
            1 => TaskSpec::new("sleep", Vec::new()).timeout(Duration::from_secs(5)),
            2 => TaskSpec::new("json_processor", format!(r#"{{"n": {}}}"#, n).into_bytes()),
            // Fails every attempt, shows the retry path
            _ => TaskSpec::new("json_processor", b"not json".to_vec())
                .max_retries(1)
                .retry_delay(Duration::from_millis(200)),
        };
        engine.submit(spec.priority(priority)).await?;
    }

    tracing::info!("Submitted {} demo tasks", count);
    Ok(())
}

/// Wait until no task in `queues` is pending, running or retrying
async fn wait_until_idle(engine: &Engine, queues: &[String]) -> anyhow::Result<()> {
    let open = [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Retrying];

    loop {
        let mut remaining = 0;
        for queue in queues {
            for status in open {
                remaining += engine.list_tasks(queue, status).await?.len();
            }
        }
        if remaining == 0 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn print_summary(engine: &Engine) -> anyhow::Result<()> {
    let queues = engine.list_queues().await?;
    println!("{}", serde_json::to_string_pretty(&queues)?);

    for queue in &queues {
        for status in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            let count = engine.list_tasks(&queue.queue, status).await?.len();
            println!("{:<12} {:<10} {}", queue.queue, status.as_str(), count);
        }
    }

    println!("{}", serde_json::to_string_pretty(&engine.list_workers())?);
    print!("{}", engine.metrics().encode()?);
    Ok(())
}
