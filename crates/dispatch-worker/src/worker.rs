use crate::{HandlerError, TaskExecutor};
use dispatch_core::{ErrorKind, RetryDecision, RetryPolicy, Task, TaskType};
use dispatch_queue::{FailOutcome, QueueError, TaskQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One independent claim-execute-report loop
pub struct Worker {
    id: String,
    queue: Arc<TaskQueue>,
    executor: Arc<TaskExecutor>,
    task_types: Vec<TaskType>,
    poll_timeout: Duration,
    backend_retry: RetryPolicy,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<TaskQueue>,
        executor: Arc<TaskExecutor>,
        task_types: Vec<TaskType>,
        poll_timeout: Duration,
        backend_retry: RetryPolicy,
    ) -> Self {
        Worker {
            id: id.into(),
            queue,
            executor,
            task_types,
            poll_timeout,
            backend_retry,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and execute until `stop` fires. `force` interrupts a running
    /// handler; its task is then failed with `worker_shutdown`.
    pub async fn run(self, stop: CancellationToken, force: CancellationToken) {
        info!(worker_id = %self.id, task_types = ?self.task_types, "Worker started");

        loop {
            let claimed = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                claimed = self.queue.dequeue(&self.task_types, &self.id, self.poll_timeout) => claimed,
            };

            match claimed {
                Ok(Some(task)) => self.process(task, &force).await,
                Ok(None) => continue,
                Err(e) if e.is_backend_unavailable() => {
                    if !self.wait_for_backend(&e, &stop).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Dequeue failed");
                    tokio::time::sleep(self.poll_timeout.min(Duration::from_secs(1))).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Stop dequeuing and poll the backend with backoff until it answers.
    /// Returns false when `stop` fired first.
    async fn wait_for_backend(&self, first: &QueueError, stop: &CancellationToken) -> bool {
        warn!(worker_id = %self.id, error = %first, "Queue backend unavailable, pausing claims");
        let mut failures = 0u32;

        loop {
            failures = failures.saturating_add(1);
            let delay = match self.backend_retry.decide(dispatch_core::ErrorClass::Transient, failures) {
                RetryDecision::Retry { delay } => self.backend_retry.jittered(delay),
                RetryDecision::GiveUp => Duration::from_millis(self.backend_retry.max_delay_ms),
            };

            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.queue.health_check() {
                Ok(()) => {
                    info!(worker_id = %self.id, attempts = failures, "Queue backend reachable again");
                    return true;
                }
                Err(e) => debug!(worker_id = %self.id, attempt = failures, error = %e, "Backend still unavailable"),
            }
        }
    }

    async fn process(&self, task: Task, force: &CancellationToken) {
        let task_id = task.id;
        let task_type = task.task_type;
        let attempt = task.retry_count + 1;

        let result = self.executor.execute(task, &self.id, force).await;
        let reported = match result {
            Ok(output) => self.queue.complete(&task_id, &self.id, output),
            Err(e) => self.report_failure(task_id, task_type, attempt, e),
        };

        // The lease returns the task to the queue if the report never lands
        if let Err(e) = reported {
            error!(worker_id = %self.id, task_id = %task_id, error = %e, "Failed to report task outcome");
        }
    }

    fn report_failure(
        &self,
        task_id: dispatch_core::TaskId,
        task_type: TaskType,
        attempt: u32,
        mut err: HandlerError,
    ) -> dispatch_queue::Result<()> {
        if err.is_cancelled() {
            if self.queue.is_cancel_requested(&task_id)? {
                return self.queue.mark_cancelled(&task_id, &self.id);
            }
            // Only shutdown cancels the token without a queue request
            err = HandlerError::new(ErrorKind::WorkerShutdown, err.message);
        }

        warn!(
            worker_id = %self.id,
            task_id = %task_id,
            task_type = %task_type,
            attempt = attempt,
            error_kind = %err.kind,
            class = ?err.class(),
            "Task failed: {}", err.message
        );

        match self.queue.fail(&task_id, &self.id, err.into_failure())? {
            FailOutcome::DeadLettered(entry) => {
                error!(
                    task_id = %task_id,
                    error_kind = %entry.error_kind,
                    retry_count = entry.retry_count,
                    "Task moved to dead letter queue"
                );
            }
            FailOutcome::Cancelled(_) => {
                info!(task_id = %task_id, "Task cancelled while its attempt failed");
            }
            FailOutcome::Retrying { .. } | FailOutcome::Ignored(_) => {}
        }
        Ok(())
    }
}
