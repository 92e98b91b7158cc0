use crate::{QueueConfig, QueueError, QueueMetrics, Result};
use chrono::{DateTime, Utc};
use dispatch_core::{
    DeadLetterEntry, Priority, Task, TaskBuilder, TaskFailure, TaskId, TaskResult, TaskStatus,
    TaskType,
};
use dispatch_persistence::{
    CancelOutcome, ClaimOutcome, CompleteOutcome, FailOutcome, PurgeReport, StoreStats, TaskStore,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Options for [`TaskQueue::enqueue_with`]
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// Falls back to `QueueConfig::default_max_retries`
    pub max_retries: Option<u32>,
    /// Not claimable before this instant
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultLookup {
    Ready(TaskResult),
    /// Known task without a result yet, with its current status
    Pending(TaskStatus),
    /// Finished task whose result outlived its retention
    Expired(TaskStatus),
    NotFound,
}

#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub reclaimed: usize,
    pub purged: PurgeReport,
}

/// Persistent priority task queue shared by producers and workers.
///
/// Waiters in `dequeue` and `get_result` are woken by in-process notifications
/// and fall back to polling the store every `poll_interval_ms`, so producers
/// and workers in other processes are still picked up.
pub struct TaskQueue {
    store: Arc<TaskStore>,
    config: QueueConfig,
    metrics: Arc<QueueMetrics>,
    task_available: Notify,
    result_ready: Notify,
}

impl TaskQueue {
    pub fn open(config: QueueConfig) -> anyhow::Result<Self> {
        let store = TaskStore::open(config.to_task_store_config())?;
        let metrics = QueueMetrics::new()?;
        Ok(Self::new(Arc::new(store), config, Arc::new(metrics)))
    }

    pub fn new(store: Arc<TaskStore>, config: QueueConfig, metrics: Arc<QueueMetrics>) -> Self {
        TaskQueue {
            store,
            config,
            metrics,
            task_available: Notify::new(),
            result_ready: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<QueueMetrics> {
        self.metrics.clone()
    }

    pub fn store(&self) -> Arc<TaskStore> {
        self.store.clone()
    }

    /// Validate and persist a task; returns its id
    pub fn enqueue(&self, task_type: TaskType, payload: Value, priority: Priority) -> Result<TaskId> {
        self.enqueue_with(
            task_type,
            payload,
            EnqueueOptions {
                priority,
                ..Default::default()
            },
        )
    }

    pub fn enqueue_with(&self, task_type: TaskType, payload: Value, options: EnqueueOptions) -> Result<TaskId> {
        let mut builder = TaskBuilder::new(task_type, payload)
            .priority(options.priority)
            .max_retries(options.max_retries.unwrap_or(self.config.default_max_retries));
        if let Some(at) = options.scheduled_at {
            builder = builder.scheduled_at(at);
        }

        let task = match builder.build() {
            Ok(task) => task,
            Err(e) => {
                warn!(task_type = %task_type, error = %e, "Rejected task at enqueue");
                return Err(e.into());
            }
        };

        let task = self.store.submit(task)?;
        self.metrics.inc_tasks_total("pending", task.task_type);
        self.task_available.notify_waiters();

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = task.priority.value(),
            "Enqueued task"
        );
        Ok(task.id)
    }

    pub fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        Ok(self.store.get_task(task_id)?)
    }

    /// Claim the best visible task among `types`, waiting up to `timeout`
    pub async fn dequeue(&self, types: &[TaskType], worker_id: &str, timeout: Duration) -> Result<Option<Task>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so a concurrent enqueue is not missed
            let notified = self.task_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_claim(types, worker_id)? {
                return Ok(Some(task));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(self.config.poll_interval());

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// One non-blocking claim attempt. Candidates come from the index; each
    /// one is claimed by compare-and-swap on the version just read, and a lost
    /// race moves on to the next candidate.
    pub fn try_claim(&self, types: &[TaskType], worker_id: &str) -> Result<Option<Task>> {
        let now = Utc::now();
        let candidates = self.store.claimable(types, now, self.config.claim_scan_limit)?;

        for (_, task_id) in candidates {
            let Some(snapshot) = self.store.get_task(&task_id)? else {
                continue;
            };
            if !snapshot.is_claimable(now) {
                continue;
            }

            match self
                .store
                .claim(&task_id, snapshot.version, worker_id, self.config.lease(), now)?
            {
                ClaimOutcome::Claimed(task) => {
                    self.metrics.inc_tasks_total("processing", task.task_type);
                    self.metrics.tasks_processing.inc();
                    debug!(task_id = %task.id, worker_id, "Dequeued task");
                    return Ok(Some(task));
                }
                ClaimOutcome::Conflict | ClaimOutcome::NotClaimable => {
                    debug!(task_id = %task_id, worker_id, "Lost claim race, trying next candidate");
                }
            }
        }

        Ok(None)
    }

    /// Store the result and mark the task completed. Idempotent; ignored
    /// unless `worker_id` holds the claim.
    pub fn complete(&self, task_id: &TaskId, worker_id: &str, output: Value) -> Result<()> {
        match self.store.complete(task_id, worker_id, output, Utc::now())? {
            CompleteOutcome::Completed(task) => {
                if let Some(started_at) = task.started_at {
                    let elapsed = (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0;
                    self.metrics.observe_processing_duration(task.task_type, elapsed);
                }
                self.metrics.inc_tasks_total("completed", task.task_type);
                self.metrics.tasks_processing.dec();
                self.result_ready.notify_waiters();
                info!(task_id = %task.id, task_type = %task.task_type, "Task completed");
            }
            CompleteOutcome::AlreadyFinished(status) => {
                debug!(task_id = %task_id, status = %status, "Ignoring completion of finished task");
            }
            CompleteOutcome::NotOwner(status) => {
                warn!(task_id = %task_id, worker_id, status = %status, "Ignoring completion from worker without the claim");
            }
        }
        Ok(())
    }

    /// Record a classified failure: schedule a retry or dead-letter the task
    pub fn fail(&self, task_id: &TaskId, worker_id: &str, failure: TaskFailure) -> Result<FailOutcome> {
        let outcome = self
            .store
            .fail(task_id, worker_id, failure, &self.config.retry, Utc::now())?;
        self.record_failure(&outcome);
        Ok(outcome)
    }

    fn record_failure(&self, outcome: &FailOutcome) {
        match outcome {
            FailOutcome::Retrying { task, delay } => {
                self.metrics.inc_tasks_total("failed", task.task_type);
                self.metrics.tasks_processing.dec();
                info!(
                    task_id = %task.id,
                    retry_count = task.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Task failed, scheduled for retry"
                );
            }
            FailOutcome::DeadLettered(entry) => {
                self.metrics.inc_tasks_total("dead", entry.task_type);
                self.metrics.inc_dead_letter(entry.task_type, entry.error_kind);
                self.metrics.tasks_processing.dec();
                self.result_ready.notify_waiters();
            }
            FailOutcome::Cancelled(task) => {
                self.metrics.inc_tasks_total("cancelled", task.task_type);
                self.metrics.tasks_processing.dec();
                self.result_ready.notify_waiters();
            }
            FailOutcome::Ignored(status) => {
                debug!(status = %status, "Ignored failure report from worker without the claim");
            }
        }
    }

    /// Cancel a task. Queued tasks stop immediately; running tasks are flagged
    /// and stop at their handler's next checkpoint.
    pub fn cancel(&self, task_id: &TaskId) -> Result<CancelOutcome> {
        let outcome = self.store.cancel(task_id, Utc::now())?;
        if let CancelOutcome::Cancelled(task) = &outcome {
            self.metrics.inc_tasks_total("cancelled", task.task_type);
            self.result_ready.notify_waiters();
        }
        Ok(outcome)
    }

    /// Worker acknowledgement that a flagged task stopped
    pub fn mark_cancelled(&self, task_id: &TaskId, worker_id: &str) -> Result<()> {
        if let Some(task) = self.store.finish_cancelled(task_id, worker_id, Utc::now())? {
            self.metrics.inc_tasks_total("cancelled", task.task_type);
            self.metrics.tasks_processing.dec();
            self.result_ready.notify_waiters();
            info!(task_id = %task.id, "Task cancelled at checkpoint");
        }
        Ok(())
    }

    pub fn is_cancel_requested(&self, task_id: &TaskId) -> Result<bool> {
        Ok(self
            .store
            .get_task(task_id)?
            .map_or(false, |task| task.cancel_requested))
    }

    /// Wait up to `timeout` for the task's result. Finished tasks answer
    /// at once, even after their result expired.
    pub async fn get_result(&self, task_id: &TaskId, timeout: Duration) -> Result<ResultLookup> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.result_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.store.get_result(task_id, Utc::now())? {
                return Ok(ResultLookup::Ready(result));
            }
            let status = match self.store.get_task(task_id)? {
                Some(task) => task.status,
                None => return Ok(ResultLookup::NotFound),
            };
            if status.is_terminal() {
                return self.finished_without_result(task_id, status);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(ResultLookup::Pending(status));
            }
            let wait = (deadline - now).min(self.config.poll_interval());

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn finished_without_result(&self, task_id: &TaskId, status: TaskStatus) -> Result<ResultLookup> {
        if status == TaskStatus::Dead {
            if let Some(entry) = self.store.get_dead_letter(task_id)? {
                if !entry.is_expired(Utc::now()) {
                    return Ok(ResultLookup::Ready(TaskResult::from_dead_letter(&entry)));
                }
            }
        }
        Ok(ResultLookup::Expired(status))
    }

    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.store.list_dead_letters(limit)?)
    }

    pub fn get_dead_letter(&self, task_id: &TaskId) -> Result<Option<DeadLetterEntry>> {
        Ok(self.store.get_dead_letter(task_id)?)
    }

    /// Operator action: return a dead task to the live queue
    pub fn replay_dead_letter(&self, task_id: &TaskId) -> Result<TaskId> {
        let task = self.store.replay_dead_letter(task_id, Utc::now())?;
        self.metrics.inc_tasks_total("replayed", task.task_type);
        self.task_available.notify_waiters();
        Ok(task.id)
    }

    /// Liveness check: can the backend be reached
    pub fn health_check(&self) -> Result<()> {
        self.store
            .ping()
            .map_err(|e| QueueError::BackendUnavailable(e.to_string()))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        Ok(self.store.stats()?)
    }

    /// Reclaim expired leases, purge expired records, refresh depth gauges
    pub fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let now = Utc::now();

        let reclaimed = self.store.reclaim_expired_leases(&self.config.retry, now)?;
        for outcome in &reclaimed {
            self.record_failure(outcome);
        }
        if !reclaimed.is_empty() {
            self.task_available.notify_waiters();
        }

        let purged = self.store.purge_expired(now)?;

        let stats = self.store.stats()?;
        for task_type in TaskType::ALL {
            let depth = stats.queued_by_type.get(&task_type).copied().unwrap_or(0);
            self.metrics.set_queue_depth(task_type, depth as i64);
        }
        self.metrics
            .tasks_processing
            .set(stats.count(TaskStatus::Processing) as i64);

        Ok(MaintenanceReport {
            reclaimed: reclaimed.len(),
            purged,
        })
    }

    /// Run maintenance every `maintenance_interval_secs` until `shutdown`
    pub fn spawn_maintenance(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.maintenance_interval_secs.max(1));
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.run_maintenance() {
                            error!("Queue maintenance failed: {}", e);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Stopping queue maintenance");
                        break;
                    }
                }
            }
        })
    }
}
