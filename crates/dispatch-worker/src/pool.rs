use crate::{HandlerRegistry, TaskExecutor, Worker, WorkerConfig};
use dispatch_queue::TaskQueue;
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Fixed-size set of independent workers sharing one queue.
///
/// Shutdown is two-phase: `stop` ends claiming, and if in-flight work
/// outlives the grace period `force` interrupts it so each held task is
/// failed back to the retry path.
pub struct WorkerPool {
    config: WorkerConfig,
    queue: Arc<TaskQueue>,
    executor: Arc<TaskExecutor>,
    base_id: String,
    stop: CancellationToken,
    force: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    maintenance: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig, queue: Arc<TaskQueue>, registry: Arc<HandlerRegistry>) -> Self {
        let executor = Arc::new(TaskExecutor::new(registry, queue.clone(), &config));
        let base_id = config.generate_worker_id();

        WorkerPool {
            config,
            queue,
            executor,
            base_id,
            stop: CancellationToken::new(),
            force: CancellationToken::new(),
            handles: Vec::new(),
            maintenance: None,
        }
    }

    pub fn base_id(&self) -> &str {
        &self.base_id
    }

    /// Spawn `concurrency` workers, plus the maintenance sweep if enabled
    pub fn start(&mut self) {
        let task_types = self.config.task_types();
        info!(
            worker_id = %self.base_id,
            concurrency = self.config.concurrency,
            task_types = ?task_types,
            "Starting worker pool"
        );

        for n in 0..self.config.concurrency.max(1) {
            let worker = Worker::new(
                format!("{}-{}", self.base_id, n),
                self.queue.clone(),
                self.executor.clone(),
                task_types.clone(),
                self.config.poll_timeout(),
                self.config.backend_retry.clone(),
            );
            let stop = self.stop.clone();
            let force = self.force.clone();
            self.handles.push(tokio::spawn(worker.run(stop, force)));
        }

        if self.config.run_maintenance {
            self.maintenance = Some(self.queue.clone().spawn_maintenance(self.stop.clone()));
        }
    }

    /// Liveness check: the queue backend answers
    pub fn health_check(&self) -> dispatch_queue::Result<()> {
        self.queue.health_check()
    }

    /// Stop claiming, wait up to the grace period, then interrupt what is left
    pub async fn shutdown(mut self) {
        info!(worker_id = %self.base_id, "Stopping worker pool");
        self.stop.cancel();

        let handles = std::mem::take(&mut self.handles);
        let mut all = Box::pin(join_all(handles));
        let grace = self.config.grace_period();

        let joined = match tokio::time::timeout(grace, &mut all).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Grace period elapsed, interrupting in-flight tasks");
                self.force.cancel();
                all.await
            }
        };
        for result in joined {
            if let Err(e) = result {
                error!("Worker task ended abnormally: {}", e);
            }
        }

        if let Some(maintenance) = self.maintenance.take() {
            if let Err(e) = maintenance.await {
                error!("Maintenance task ended abnormally: {}", e);
            }
        }
        info!(worker_id = %self.base_id, "Worker pool stopped");
    }

    /// Run until `signal` resolves, then shut down gracefully
    pub async fn run_until<F>(mut self, signal: F)
    where
        F: std::future::Future<Output = ()>,
    {
        self.start();
        signal.await;
        self.shutdown().await;
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop.cancel();
        self.force.cancel();
    }
}
