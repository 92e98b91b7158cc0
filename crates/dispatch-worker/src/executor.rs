use crate::{HandlerError, HandlerRegistry, TaskContext, WorkerConfig};
use dispatch_core::{ErrorKind, Task, TaskType};
use dispatch_queue::TaskQueue;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs handlers under the per-type budget with panic recovery
pub struct TaskExecutor {
    registry: Arc<HandlerRegistry>,
    queue: Arc<TaskQueue>,
    budgets: HashMap<TaskType, Duration>,
}

impl TaskExecutor {
    pub fn new(registry: Arc<HandlerRegistry>, queue: Arc<TaskQueue>, config: &WorkerConfig) -> Self {
        let budgets = TaskType::ALL
            .into_iter()
            .map(|t| (t, config.timeout_for(t)))
            .collect();

        TaskExecutor {
            registry,
            queue,
            budgets,
        }
    }

    pub fn budget(&self, task_type: TaskType) -> Duration {
        self.budgets
            .get(&task_type)
            .copied()
            .unwrap_or_else(|| task_type.default_timeout())
    }

    /// Execute `task` on its handler.
    ///
    /// The handler runs on its own tokio task so a panic surfaces as a
    /// `panicked` error. Exceeding the budget yields `timeout`; `shutdown`
    /// firing first aborts the handler and yields `worker_shutdown`.
    pub async fn execute(&self, task: Task, worker_id: &str, shutdown: &CancellationToken) -> Result<Value, HandlerError> {
        let task_id = task.id;
        let task_type = task.task_type;

        let handler = self.registry.get(task_type).ok_or_else(|| {
            HandlerError::new(ErrorKind::NoHandler, format!("no handler registered for {}", task_type))
        })?;

        let budget = self.budget(task_type);
        let cancel = shutdown.child_token();
        let ctx = TaskContext::new(
            task_id,
            task_type,
            worker_id,
            Instant::now() + budget,
            cancel.clone(),
            self.queue.clone(),
        );

        info!(task_id = %task_id, task_type = %task_type, budget_secs = budget.as_secs(), "Executing task");

        let mut handle = tokio::spawn(async move { handler.handle(&task, &ctx).await });

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                cancel.cancel();
                handle.abort();
                warn!(task_id = %task_id, "Task interrupted by worker shutdown");
                Err(shutdown_error())
            }
            joined = tokio::time::timeout(budget, &mut handle) => match joined {
                // Stopped by the shutdown token, not by a cancel request
                Ok(Ok(Err(e))) if e.is_cancelled() && shutdown.is_cancelled() => {
                    warn!(task_id = %task_id, "Task stopped at checkpoint during worker shutdown");
                    Err(shutdown_error())
                }
                Ok(Ok(result)) => result,
                Ok(Err(e)) if e.is_panic() => {
                    error!(task_id = %task_id, "Handler panicked");
                    Err(HandlerError::new(ErrorKind::Panicked, "handler panicked"))
                }
                Ok(Err(e)) => Err(HandlerError::new(ErrorKind::Internal, e.to_string())),
                Err(_) => {
                    cancel.cancel();
                    handle.abort();
                    warn!(task_id = %task_id, budget_secs = budget.as_secs(), "Task exceeded its budget");
                    Err(HandlerError::new(
                        ErrorKind::Timeout,
                        format!("exceeded {:?} budget for {}", budget, task_type),
                    ))
                }
            },
        }
    }
}

fn shutdown_error() -> HandlerError {
    HandlerError::new(ErrorKind::WorkerShutdown, "worker shut down before the task finished")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskHandler;
    use async_trait::async_trait;
    use dispatch_core::Priority;
    use dispatch_queue::QueueConfig;
    use serde_json::json;
    use tempfile::TempDir;

    struct Sleep(Duration);

    #[async_trait]
    impl TaskHandler for Sleep {
        async fn handle(&self, _task: &Task, ctx: &TaskContext) -> Result<Value, HandlerError> {
            tokio::time::sleep(self.0).await;
            ctx.checkpoint()?;
            Ok(json!({ "slept_ms": self.0.as_millis() as u64 }))
        }
    }

    /// Waits on its cancellation token like a cooperative handler
    struct Cooperative;

    #[async_trait]
    impl TaskHandler for Cooperative {
        async fn handle(&self, _task: &Task, ctx: &TaskContext) -> Result<Value, HandlerError> {
            ctx.cancellation_token().cancelled().await;
            ctx.checkpoint()?;
            Ok(Value::Null)
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskHandler for Panics {
        async fn handle(&self, _task: &Task, _ctx: &TaskContext) -> Result<Value, HandlerError> {
            panic!("boom");
        }
    }

    fn setup(registry: HandlerRegistry, prediction_budget_secs: u64) -> (TempDir, Arc<TaskQueue>, TaskExecutor) {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(
            TaskQueue::open(QueueConfig {
                data_dir: dir.path().to_path_buf(),
                ..Default::default()
            })
            .unwrap(),
        );
        let mut config = WorkerConfig::default();
        config.timeouts.insert(TaskType::MlPrediction, prediction_budget_secs);
        let executor = TaskExecutor::new(Arc::new(registry), queue.clone(), &config);
        (dir, queue, executor)
    }

    fn prediction() -> Task {
        Task::new(
            TaskType::MlPrediction,
            json!({ "model_id": "m-1", "input_data": { "x": 1 } }),
            Priority::normal(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_success() {
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::MlPrediction, Sleep(Duration::from_millis(5)));
        let (_dir, _queue, executor) = setup(registry, 60);

        let output = executor
            .execute(prediction(), "w-1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output["slept_ms"], 5);
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let (_dir, _queue, executor) = setup(HandlerRegistry::new(), 60);
        let err = executor
            .execute(prediction(), "w-1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoHandler);
    }

    #[tokio::test]
    async fn test_budget_exceeded() {
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::MlPrediction, Sleep(Duration::from_secs(30)));
        let (_dir, _queue, executor) = setup(registry, 1);

        let err = executor
            .execute(prediction(), "w-1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::MlPrediction, Panics);
        let (_dir, _queue, executor) = setup(registry, 60);

        let err = executor
            .execute(prediction(), "w-1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Panicked);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts() {
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::MlPrediction, Sleep(Duration::from_secs(30)));
        let (_dir, _queue, executor) = setup(registry, 60);

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = executor.execute(prediction(), "w-1", &shutdown).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::WorkerShutdown);
    }

    #[tokio::test]
    async fn test_shutdown_seen_at_checkpoint_is_not_a_cancellation() {
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::MlPrediction, Cooperative);
        let (_dir, _queue, executor) = setup(registry, 60);

        for _ in 0..20 {
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                trigger.cancel();
            });

            let err = executor.execute(prediction(), "w-1", &shutdown).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::WorkerShutdown);
            assert_ne!(err.class(), dispatch_core::ErrorClass::Fatal);
        }
    }
}
