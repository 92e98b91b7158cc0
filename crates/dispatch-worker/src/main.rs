use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use dispatch_core::TaskType;
use dispatch_llm::{LlmOrchestrator, RoutingConfig};
use dispatch_queue::TaskQueue;
use dispatch_worker::{HandlerRegistry, LlmTaskHandler, TaskHandler, WorkerConfig, WorkerPool};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dispatch-worker")]
#[command(about = "Task dispatch worker pool", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    /// Worker ID prefix (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Number of concurrent workers
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Queue data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Routing configuration file
    #[arg(long)]
    routing: Option<String>,

    /// Serve /metrics and /health on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        WorkerConfig::from_file(config_path)?
    } else {
        WorkerConfig::default()
    };

    // Override with CLI args
    if let Some(worker_id) = args.worker_id {
        config.worker_id = Some(worker_id);
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(data_dir) = args.data_dir {
        config.queue.data_dir = data_dir;
    }
    if let Some(routing) = args.routing {
        config.routing_config = Some(routing);
    }
    if args.metrics_port.is_some() {
        config.metrics_port = args.metrics_port;
    }
    config.log_json |= args.json_logs;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }

    // Routing config is validated before anything is claimed
    let routing = match &config.routing_config {
        Some(path) => RoutingConfig::from_file(path)?,
        None => RoutingConfig::default(),
    };
    let orchestrator = Arc::new(LlmOrchestrator::from_config(routing)?);

    let queue = Arc::new(TaskQueue::open(config.queue.clone())?);
    queue.health_check()?;

    let mut registry = HandlerRegistry::new();
    let llm_handler: Arc<dyn TaskHandler> = Arc::new(LlmTaskHandler::new(orchestrator));
    registry.register_shared(&TaskType::ALL, llm_handler);
    tracing::info!("Registered task types: {:?}", registry.task_types());

    if let Some(port) = config.metrics_port {
        let app = Router::new()
            .route("/metrics", get(metrics))
            .route("/health", get(health))
            .with_state(queue.clone());
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::info!("Metrics server listening on 0.0.0.0:{}", port);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    let pool = WorkerPool::new(config, queue, Arc::new(registry));
    pool.run_until(async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal");
    })
    .await;

    Ok(())
}

async fn metrics(State(queue): State<Arc<TaskQueue>>) -> (StatusCode, String) {
    match queue.metrics().render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn health(State(queue): State<Arc<TaskQueue>>) -> (StatusCode, String) {
    match queue.health_check() {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}
