use crate::{ErrorKind, Priority, Task, TaskFailure, TaskId, TaskType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failed,
    Cancelled,
}

/// Outcome of a task as returned to callers of `get_result`.
///
/// Written once per task; later writes for the same id are no-ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: ResultStatus,
    pub payload: Value,
    pub completed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(task_id: TaskId, payload: Value, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            task_id,
            status: ResultStatus::Success,
            payload,
            completed_at: now,
            expires_at: now + ttl,
        }
    }

    /// Failure result carrying the error summary of a dead task
    pub fn failed(
        task_id: TaskId,
        failure: &TaskFailure,
        retry_count: u32,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            task_id,
            status: ResultStatus::Failed,
            payload: failure_summary(failure.kind, &failure.message, retry_count),
            completed_at: now,
            expires_at: now + ttl,
        }
    }

    /// Failure result rebuilt from a dead letter entry, valid as long as the
    /// entry itself
    pub fn from_dead_letter(entry: &DeadLetterEntry) -> Self {
        Self {
            task_id: entry.task_id,
            status: ResultStatus::Failed,
            payload: failure_summary(entry.error_kind, &entry.error_message, entry.retry_count),
            completed_at: entry.failed_at,
            expires_at: entry.expires_at,
        }
    }

    pub fn cancelled(task_id: TaskId, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            task_id,
            status: ResultStatus::Cancelled,
            payload: Value::Null,
            completed_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn failure_summary(kind: ErrorKind, message: &str, retry_count: u32) -> Value {
    json!({
        "error_kind": kind,
        "error_message": message,
        "retry_count": retry_count,
    })
}

/// A task that exhausted its retries or failed fatally, kept for operator
/// inspection and manual replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub original_payload: Value,
    pub priority: Priority,
    pub error_kind: ErrorKind,
    pub error_message: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    /// Worker that held the final attempt
    pub claimed_by: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Capture a task at the moment it dies. `claimed_by` is taken before the
    /// claim is released.
    pub fn from_task(
        task: &Task,
        failure: &TaskFailure,
        claimed_by: Option<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type,
            original_payload: task.payload.clone(),
            priority: task.priority,
            error_kind: failure.kind,
            error_message: failure.message.clone(),
            retry_count: task.retry_count,
            failed_at: now,
            claimed_by,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_keeps_full_context() {
        let mut task = Task::new(
            TaskType::MlPrediction,
            json!({ "model_id": "churn", "input_data": { "user": "u1" } }),
            Priority::high(),
        )
        .unwrap();
        let now = Utc::now();
        let failure = TaskFailure::new(ErrorKind::Timeout, "exceeded 60s");
        task.move_to_dead(failure.clone(), now);

        let ttl = Duration::seconds(crate::DEAD_LETTER_TTL_SECS);
        let entry = DeadLetterEntry::from_task(&task, &failure, Some("worker-7".into()), now, ttl);
        assert_eq!(entry.error_kind, ErrorKind::Timeout);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.original_payload["model_id"], "churn");
        assert_eq!(entry.expires_at - entry.failed_at, Duration::days(7));
        assert!(!entry.is_expired(now));
    }

    #[test]
    fn test_failed_result_exposes_error_summary() {
        let failure = TaskFailure::new(ErrorKind::RateLimited, "429 from provider");
        let result = TaskResult::failed(TaskId::new_v4(), &failure, 3, Utc::now(), Duration::hours(1));
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.payload["error_kind"], "rate_limited");
        assert_eq!(result.payload["retry_count"], 3);
    }

    #[test]
    fn test_dead_letter_result_outlives_result_ttl() {
        let mut task = Task::new(TaskType::Generate3d, json!({ "prompt": "tee" }), Priority::normal()).unwrap();
        let now = Utc::now();
        let failure = TaskFailure::new(ErrorKind::Auth, "401");
        task.move_to_dead(failure.clone(), now);
        let entry = DeadLetterEntry::from_task(&task, &failure, None, now, Duration::days(7));

        let result = TaskResult::from_dead_letter(&entry);
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.payload["error_kind"], "auth");
        assert_eq!(result.payload["retry_count"], 1);
        assert!(!result.is_expired(now + Duration::days(2)));
    }
}
