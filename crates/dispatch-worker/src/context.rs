use crate::HandlerError;
use dispatch_core::{TaskId, TaskType};
use dispatch_queue::TaskQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-execution handle passed to a [`TaskHandler`](crate::TaskHandler):
/// the deadline of the type's budget and a token cancelled on shutdown or
/// when the task is cancelled in the queue.
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    task_type: TaskType,
    worker_id: String,
    deadline: Instant,
    cancel: CancellationToken,
    queue: Arc<TaskQueue>,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        task_type: TaskType,
        worker_id: impl Into<String>,
        deadline: Instant,
        cancel: CancellationToken,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            task_id,
            task_type,
            worker_id: worker_id.into(),
            deadline,
            cancel,
            queue,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancellation point between handler steps.
    ///
    /// Fails with a `cancelled` error when the token was cancelled or the
    /// queue carries a cancel request for this task. A backend read error is
    /// logged and does not stop the handler.
    pub fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.cancel.is_cancelled() {
            return Err(HandlerError::cancelled());
        }

        match self.queue.is_cancel_requested(&self.task_id) {
            Ok(true) => {
                debug!(task_id = %self.task_id, "Cancel request observed at checkpoint");
                self.cancel.cancel();
                Err(HandlerError::cancelled())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Could not read cancel flag");
                Ok(())
            }
        }
    }
}
