use crate::{ErrorKind, Priority, Result, TaskError, TaskType, DEFAULT_MAX_RETRIES};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a task
pub type TaskId = Uuid;

/// Task status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Finished successfully (terminal)
    Completed,
    /// Failed and waiting for its retry visibility time
    Failed,
    /// Retries exhausted or fatal failure; lives in the dead letter queue (terminal)
    Dead,
    /// Cancelled by an operator or producer (terminal)
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Dead,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Dead => "dead",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Dead | TaskStatus::Cancelled
        )
    }

    /// Pending and failed-awaiting-retry tasks both sit in the priority index
    pub fn is_queued(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure reported against a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Persisted task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: Value,
    pub priority: Priority,
    pub status: TaskStatus,

    /// Failed attempts so far
    pub retry_count: u32,
    pub max_retries: u32,

    /// Enqueue order, assigned by the store; breaks priority ties FIFO
    pub sequence: u64,
    /// Bumped on every committed write; claims compare against it
    pub version: u64,

    pub created_at: DateTime<Utc>,
    /// Not claimable before this instant (scheduled enqueue or retry backoff)
    pub visible_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Worker currently holding the claim
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub cancel_requested: bool,
    pub last_error: Option<TaskFailure>,
}

impl Task {
    /// Build a validated task with default options
    pub fn new(task_type: TaskType, payload: Value, priority: Priority) -> Result<Self> {
        TaskBuilder::new(task_type, payload).priority(priority).build()
    }

    pub fn builder(task_type: TaskType, payload: Value) -> TaskBuilder {
        TaskBuilder::new(task_type, payload)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(TaskError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(TaskError::from)
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status.is_queued() && self.visible_at <= now && !self.cancel_requested
    }

    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing
            && self.lease_expires_at.map_or(false, |expires| expires <= now)
    }

    /// Processing under `worker_id`'s claim; only the holder may report back
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.status == TaskStatus::Processing && self.claimed_by.as_deref() == Some(worker_id)
    }

    pub fn claim(&mut self, worker_id: &str, lease: Duration, now: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.claimed_by = Some(worker_id.to_string());
        self.started_at = Some(now);
        self.lease_expires_at = Some(now + lease);
        self.updated_at = now;
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.release_claim();
    }

    /// Count a failed attempt and hold the task back until `now + delay`
    pub fn retry_after(&mut self, failure: TaskFailure, delay: Duration, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_error = Some(failure);
        self.status = TaskStatus::Failed;
        self.visible_at = now + delay;
        self.updated_at = now;
        self.release_claim();
    }

    /// Count the final failed attempt and mark the task dead
    pub fn move_to_dead(&mut self, failure: TaskFailure, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_error = Some(failure);
        self.status = TaskStatus::Dead;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.release_claim();
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelled;
        self.cancel_requested = true;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.release_claim();
    }

    /// Return a dead task to the live queue with a fresh retry budget
    pub fn reset_for_replay(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.retry_count = 0;
        self.last_error = None;
        self.cancel_requested = false;
        self.visible_at = now;
        self.started_at = None;
        self.completed_at = None;
        self.updated_at = now;
        self.release_claim();
    }

    fn release_claim(&mut self) {
        self.claimed_by = None;
        self.lease_expires_at = None;
    }
}

/// Builder for tasks with custom scheduling and retry budget
pub struct TaskBuilder {
    task_type: TaskType,
    payload: Value,
    priority: Priority,
    scheduled_at: Option<DateTime<Utc>>,
    max_retries: u32,
}

impl TaskBuilder {
    pub fn new(task_type: TaskType, payload: Value) -> Self {
        TaskBuilder {
            task_type,
            payload,
            priority: Priority::default(),
            scheduled_at: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Validates the payload against the task type's schema
    pub fn build(self) -> Result<Task> {
        self.task_type.validate_payload(&self.payload)?;

        let now = Utc::now();
        Ok(Task {
            id: Uuid::new_v4(),
            task_type: self.task_type,
            payload: self.payload,
            priority: self.priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries.max(1),
            sequence: 0,
            version: 0,
            created_at: now,
            visible_at: self.scheduled_at.unwrap_or(now),
            updated_at: now,
            started_at: None,
            completed_at: None,
            claimed_by: None,
            lease_expires_at: None,
            cancel_requested: false,
            last_error: None,
        })
    }
}
