use crate::index::{self, IndexKey};
use crate::{PersistenceError, Result, WalEntry, WriteAheadLog};
use chrono::{DateTime, Duration, Utc};
use dispatch_core::{
    DeadLetterEntry, ErrorKind, RetryDecision, RetryPolicy, Task, TaskFailure, TaskId, TaskResult,
    TaskStatus, TaskType, DEAD_LETTER_TTL_SECS,
};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TaskStoreConfig {
    pub data_dir: PathBuf,
    pub result_ttl_secs: i64,
    pub dead_letter_ttl_secs: i64,
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        TaskStoreConfig {
            data_dir: PathBuf::from("./data"),
            result_ttl_secs: 24 * 60 * 60,
            dead_letter_ttl_secs: DEAD_LETTER_TTL_SECS,
        }
    }
}

const CF_TASKS: &str = "tasks";
const CF_PENDING_INDEX: &str = "pending_index";
const CF_RESULTS: &str = "results";
const CF_DEAD_LETTER: &str = "dead_letter";
const CF_META: &str = "meta";

const META_NEXT_SEQUENCE: &[u8] = b"next_sequence";

#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(Task),
    /// The record changed since it was read
    Conflict,
    /// No longer pending, not yet visible, or cancel requested
    NotClaimable,
}

#[derive(Debug)]
pub enum CompleteOutcome {
    Completed(Task),
    /// Terminal already; nothing was written
    AlreadyFinished(TaskStatus),
    /// The reporting worker no longer holds the claim; nothing was written
    NotOwner(TaskStatus),
}

#[derive(Debug)]
pub enum FailOutcome {
    Retrying { task: Task, delay: StdDuration },
    DeadLettered(DeadLetterEntry),
    /// A cancel request was pending, so the failed attempt ends the task
    Cancelled(Task),
    /// The reporting worker does not hold a processing claim; the report was dropped
    Ignored(TaskStatus),
}

#[derive(Debug)]
pub enum CancelOutcome {
    /// Was waiting in the queue and is now terminal
    Cancelled(Task),
    /// Is running; the flag is set for the handler to observe
    Requested(Task),
    AlreadyFinished(TaskStatus),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub results: usize,
    pub dead_letters: usize,
    pub tasks: usize,
}

#[derive(Debug, Default, Clone)]
pub struct StoreStats {
    pub by_status: HashMap<TaskStatus, usize>,
    /// Pending or awaiting retry, per type
    pub queued_by_type: HashMap<TaskType, usize>,
    pub dead_letters: usize,
}

impl StoreStats {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// RocksDB-backed task store.
///
/// Task records live in `tasks` keyed by id. Queued tasks also have an entry
/// in `pending_index` ordered by type, priority, and enqueue sequence. Every
/// mutation goes through `commit_lock`, re-reads the record, compares its
/// version, and writes the record and index changes in one `WriteBatch`.
pub struct TaskStore {
    db: DB,
    wal: WriteAheadLog,
    config: TaskStoreConfig,
    /// Guards the read-compare-write window; holds the next enqueue sequence
    commit_lock: Mutex<u64>,
}

impl TaskStore {
    pub fn open(config: TaskStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let db_path = config.data_dir.join("tasks");
        let wal_path = config.data_dir.join("wal");

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors = [CF_TASKS, CF_PENDING_INDEX, CF_RESULTS, CF_DEAD_LETTER, CF_META]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&db_opts, db_path, cf_descriptors)?;
        let wal = WriteAheadLog::open(wal_path)?;

        let meta = db
            .cf_handle(CF_META)
            .ok_or_else(|| PersistenceError::Corrupt("missing meta column family".to_string()))?;
        let next_sequence = match db.get_cf(meta, META_NEXT_SEQUENCE)? {
            Some(bytes) => decode_u64(&bytes)?,
            None => 1,
        };

        info!(
            data_dir = ?config.data_dir,
            next_sequence,
            "Opened task store"
        );

        Ok(TaskStore {
            db,
            wal,
            config,
            commit_lock: Mutex::new(next_sequence),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Corrupt(format!("missing column family {}", name)))
    }

    fn read<T: DeserializeOwned>(&self, cf_name: &str, task_id: &TaskId) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf_name)?, task_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load(&self, task_id: &TaskId) -> Result<Task> {
        self.get_task(task_id)?
            .ok_or_else(|| PersistenceError::TaskNotFound(*task_id))
    }

    /// Stage `next` over `prev`: bump the version, write the record, and keep
    /// the index entry in step with the queued/unqueued status change.
    fn stage(&self, batch: &mut WriteBatch, prev: &Task, next: &mut Task) -> Result<()> {
        next.version = prev.version + 1;
        batch.put_cf(self.cf(CF_TASKS)?, next.id.as_bytes(), next.to_bytes()?);

        let index_cf = self.cf(CF_PENDING_INDEX)?;
        let prev_key = IndexKey::for_task(prev).encode();
        if prev.status.is_queued() && (!next.status.is_queued() || IndexKey::for_task(next).encode() != prev_key) {
            batch.delete_cf(index_cf, prev_key);
        }
        if next.status.is_queued() {
            batch.put_cf(
                index_cf,
                IndexKey::for_task(next).encode(),
                index::encode_value(&next.id, next.visible_at),
            );
        }
        Ok(())
    }

    fn stage_result_if_absent(&self, batch: &mut WriteBatch, result: &TaskResult) -> Result<bool> {
        let cf = self.cf(CF_RESULTS)?;
        if self.db.get_cf(cf, result.task_id.as_bytes())?.is_some() {
            return Ok(false);
        }
        batch.put_cf(cf, result.task_id.as_bytes(), serde_json::to_vec(result)?);
        Ok(true)
    }

    fn result_ttl(&self) -> Duration {
        Duration::seconds(self.config.result_ttl_secs)
    }

    /// Persist a new task, assigning its enqueue sequence
    pub fn submit(&self, mut task: Task) -> Result<Task> {
        let mut next_sequence = self.commit_lock.lock();

        if self.db.get_cf(self.cf(CF_TASKS)?, task.id.as_bytes())?.is_some() {
            return Err(PersistenceError::Corrupt(format!("duplicate task id {}", task.id)));
        }

        task.sequence = *next_sequence;
        task.version = 1;
        task.status = TaskStatus::Pending;

        self.wal.append(&WalEntry::Submitted {
            task_id: task.id,
            task_type: task.task_type,
            priority: task.priority,
            visible_at: task.visible_at,
            timestamp: Utc::now(),
        })?;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_TASKS)?, task.id.as_bytes(), task.to_bytes()?);
        batch.put_cf(
            self.cf(CF_PENDING_INDEX)?,
            IndexKey::for_task(&task).encode(),
            index::encode_value(&task.id, task.visible_at),
        );
        batch.put_cf(
            self.cf(CF_META)?,
            META_NEXT_SEQUENCE,
            (task.sequence + 1).to_be_bytes(),
        );
        self.db.write(batch)?;
        *next_sequence += 1;

        debug!(task_id = %task.id, task_type = %task.task_type, sequence = task.sequence, "Submitted task");
        Ok(task)
    }

    pub fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        self.read(CF_TASKS, task_id)
    }

    /// Visible index entries for `types`, best first (priority, then FIFO).
    ///
    /// Reads the index without taking the commit lock; callers confirm each
    /// candidate with [`TaskStore::claim`].
    pub fn claimable(&self, types: &[TaskType], now: DateTime<Utc>, limit: usize) -> Result<Vec<(IndexKey, TaskId)>> {
        let index_cf = self.cf(CF_PENDING_INDEX)?;
        let mut candidates = Vec::new();

        for task_type in types {
            let prefix = [task_type.code()];
            let mut taken = 0;
            for item in self.db.iterator_cf(index_cf, IteratorMode::From(&prefix, Direction::Forward)) {
                let (key, value) = item?;
                if key.first() != Some(&task_type.code()) || taken >= limit {
                    break;
                }
                let (task_id, visible_at) = index::decode_value(&value)?;
                if visible_at <= now {
                    candidates.push((IndexKey::decode(&key)?, task_id));
                    taken += 1;
                }
            }
        }

        candidates.sort_by(|(a, _), (b, _)| {
            b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    /// Compare-and-swap claim: succeeds only if the record is still at
    /// `expected_version` and claimable.
    pub fn claim(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let _guard = self.commit_lock.lock();

        let prev = match self.get_task(task_id)? {
            Some(task) => task,
            None => return Ok(ClaimOutcome::NotClaimable),
        };
        if prev.version != expected_version {
            return Ok(ClaimOutcome::Conflict);
        }
        if !prev.is_claimable(now) {
            return Ok(ClaimOutcome::NotClaimable);
        }

        let mut task = prev.clone();
        task.claim(worker_id, lease, now);

        let mut batch = WriteBatch::default();
        self.stage(&mut batch, &prev, &mut task)?;

        self.wal.append(&WalEntry::Claimed {
            task_id: task.id,
            worker_id: worker_id.to_string(),
            version: task.version,
            timestamp: now,
        })?;
        self.db.write(batch)?;

        debug!(task_id = %task.id, worker_id, version = task.version, "Claimed task");
        Ok(ClaimOutcome::Claimed(task))
    }

    /// Store the success result and mark the task completed. Only the worker
    /// holding the claim may complete; a second call is a no-op that leaves
    /// the first result in place.
    pub fn complete(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        output: Value,
        now: DateTime<Utc>,
    ) -> Result<CompleteOutcome> {
        let _guard = self.commit_lock.lock();

        let prev = self.load(task_id)?;
        if prev.status.is_terminal() {
            return Ok(CompleteOutcome::AlreadyFinished(prev.status));
        }
        if !prev.is_held_by(worker_id) {
            debug!(task_id = %prev.id, worker_id, holder = ?prev.claimed_by, "Dropped completion from non-holder");
            return Ok(CompleteOutcome::NotOwner(prev.status));
        }

        let mut task = prev.clone();
        task.complete(now);

        let mut batch = WriteBatch::default();
        self.stage(&mut batch, &prev, &mut task)?;
        let result = TaskResult::success(task.id, output, now, self.result_ttl());
        self.stage_result_if_absent(&mut batch, &result)?;

        self.wal.append(&WalEntry::Completed {
            task_id: task.id,
            timestamp: now,
        })?;
        self.db.write(batch)?;

        debug!(task_id = %task.id, "Completed task");
        Ok(CompleteOutcome::Completed(task))
    }

    /// Record a failed attempt reported by the worker holding the claim.
    /// Retries are scheduled by visibility time; exhausted or fatal failures
    /// move to the dead letter queue and leave a failed result behind.
    pub fn fail(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        failure: TaskFailure,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        let _guard = self.commit_lock.lock();
        let prev = self.load(task_id)?;
        if !prev.is_held_by(worker_id) {
            debug!(task_id = %prev.id, worker_id, holder = ?prev.claimed_by, "Dropped failure from non-holder");
            return Ok(FailOutcome::Ignored(prev.status));
        }
        self.fail_locked(prev, failure, policy, now)
    }

    /// Caller holds `commit_lock` and has checked that `prev` is processing
    fn fail_locked(
        &self,
        prev: Task,
        failure: TaskFailure,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        if prev.status != TaskStatus::Processing {
            return Ok(FailOutcome::Ignored(prev.status));
        }

        // A cancelled task is never retried
        if prev.cancel_requested {
            let mut task = prev.clone();
            task.last_error = Some(failure.clone());
            task.cancel(now);

            let mut batch = WriteBatch::default();
            self.stage(&mut batch, &prev, &mut task)?;
            let result = TaskResult::cancelled(task.id, now, self.result_ttl());
            self.stage_result_if_absent(&mut batch, &result)?;
            self.wal.append(&WalEntry::Cancelled {
                task_id: task.id,
                timestamp: now,
            })?;
            self.db.write(batch)?;

            info!(task_id = %task.id, error_kind = %failure.kind, "Cancelled task after its final attempt failed");
            return Ok(FailOutcome::Cancelled(task));
        }

        let decision = policy
            .with_max_retries(prev.max_retries)
            .decide(failure.kind.class(), prev.retry_count + 1);

        let mut task = prev.clone();
        let mut batch = WriteBatch::default();

        match decision {
            RetryDecision::Retry { delay } => {
                let backoff = Duration::from_std(delay)
                    .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
                task.retry_after(failure.clone(), backoff, now);
                self.stage(&mut batch, &prev, &mut task)?;

                self.wal.append(&WalEntry::RetryScheduled {
                    task_id: task.id,
                    error_kind: failure.kind,
                    retry_count: task.retry_count,
                    visible_at: task.visible_at,
                    timestamp: now,
                })?;
                self.db.write(batch)?;

                debug!(
                    task_id = %task.id,
                    error_kind = %failure.kind,
                    retry_count = task.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduled task retry"
                );
                Ok(FailOutcome::Retrying { task, delay })
            }
            RetryDecision::GiveUp => {
                let claimed_by = prev.claimed_by.clone();
                task.move_to_dead(failure.clone(), now);
                self.stage(&mut batch, &prev, &mut task)?;

                let entry = DeadLetterEntry::from_task(
                    &task,
                    &failure,
                    claimed_by,
                    now,
                    Duration::seconds(self.config.dead_letter_ttl_secs),
                );
                batch.put_cf(self.cf(CF_DEAD_LETTER)?, task.id.as_bytes(), serde_json::to_vec(&entry)?);
                let result = TaskResult::failed(task.id, &failure, task.retry_count, now, self.result_ttl());
                self.stage_result_if_absent(&mut batch, &result)?;

                self.wal.append(&WalEntry::DeadLettered {
                    task_id: task.id,
                    error_kind: failure.kind,
                    retry_count: task.retry_count,
                    timestamp: now,
                })?;
                self.db.write(batch)?;

                warn!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    error_kind = %failure.kind,
                    retry_count = task.retry_count,
                    "Moved task to dead letter queue"
                );
                Ok(FailOutcome::DeadLettered(entry))
            }
        }
    }

    /// Fail every processing task whose lease ran out with `lease_expired`
    pub fn reclaim_expired_leases(&self, policy: &RetryPolicy, now: DateTime<Utc>) -> Result<Vec<FailOutcome>> {
        let expired: Vec<TaskId> = self
            .tasks_with_status(TaskStatus::Processing)?
            .into_iter()
            .filter(|task| task.is_lease_expired(now))
            .map(|task| task.id)
            .collect();

        let mut outcomes = Vec::with_capacity(expired.len());
        for task_id in expired {
            let _guard = self.commit_lock.lock();
            let prev = match self.get_task(&task_id)? {
                Some(task) if task.is_lease_expired(now) => task,
                // Reported back in the meantime
                _ => continue,
            };
            let failure = TaskFailure::new(
                ErrorKind::LeaseExpired,
                format!(
                    "lease held by {} expired",
                    prev.claimed_by.as_deref().unwrap_or("unknown worker")
                ),
            );
            outcomes.push(self.fail_locked(prev, failure, policy, now)?);
        }

        if !outcomes.is_empty() {
            info!(count = outcomes.len(), "Reclaimed tasks with expired leases");
        }
        Ok(outcomes)
    }

    pub fn cancel(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<CancelOutcome> {
        let _guard = self.commit_lock.lock();

        let prev = self.load(task_id)?;
        if prev.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished(prev.status));
        }

        let mut task = prev.clone();
        let mut batch = WriteBatch::default();

        if prev.status == TaskStatus::Processing {
            task.cancel_requested = true;
            task.updated_at = now;
            self.stage(&mut batch, &prev, &mut task)?;
            self.wal.append(&WalEntry::CancelRequested {
                task_id: task.id,
                timestamp: now,
            })?;
            self.db.write(batch)?;

            debug!(task_id = %task.id, "Requested cancellation of running task");
            return Ok(CancelOutcome::Requested(task));
        }

        task.cancel(now);
        self.stage(&mut batch, &prev, &mut task)?;
        let result = TaskResult::cancelled(task.id, now, self.result_ttl());
        self.stage_result_if_absent(&mut batch, &result)?;
        self.wal.append(&WalEntry::Cancelled {
            task_id: task.id,
            timestamp: now,
        })?;
        self.db.write(batch)?;

        debug!(task_id = %task.id, "Cancelled queued task");
        Ok(CancelOutcome::Cancelled(task))
    }

    /// Worker-side acknowledgement that a running task stopped at a
    /// cancellation checkpoint. Returns `None` when `worker_id` no longer
    /// holds the claim.
    pub fn finish_cancelled(&self, task_id: &TaskId, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        let _guard = self.commit_lock.lock();

        let prev = self.load(task_id)?;
        if !prev.is_held_by(worker_id) {
            return Ok(None);
        }

        let mut task = prev.clone();
        task.cancel(now);

        let mut batch = WriteBatch::default();
        self.stage(&mut batch, &prev, &mut task)?;
        let result = TaskResult::cancelled(task.id, now, self.result_ttl());
        self.stage_result_if_absent(&mut batch, &result)?;
        self.wal.append(&WalEntry::Cancelled {
            task_id: task.id,
            timestamp: now,
        })?;
        self.db.write(batch)?;

        Ok(Some(task))
    }

    /// Stored result, unless it has expired
    pub fn get_result(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<Option<TaskResult>> {
        Ok(self
            .read::<TaskResult>(CF_RESULTS, task_id)?
            .filter(|result| !result.is_expired(now)))
    }

    pub fn get_dead_letter(&self, task_id: &TaskId) -> Result<Option<DeadLetterEntry>> {
        self.read(CF_DEAD_LETTER, task_id)
    }

    /// Dead letter entries, oldest failure first
    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let mut entries: Vec<DeadLetterEntry> = self.scan(CF_DEAD_LETTER)?;
        entries.sort_by_key(|entry| entry.failed_at);
        entries.truncate(limit);
        Ok(entries)
    }

    /// Operator replay: put a dead task back in the live queue with a fresh
    /// retry budget and a new place at the back of its priority band.
    pub fn replay_dead_letter(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<Task> {
        let mut next_sequence = self.commit_lock.lock();

        if self.get_dead_letter(task_id)?.is_none() {
            return Err(PersistenceError::TaskNotFound(*task_id));
        }
        let prev = self.load(task_id)?;

        let mut task = prev.clone();
        task.reset_for_replay(now);
        task.sequence = *next_sequence;

        let mut batch = WriteBatch::default();
        self.stage(&mut batch, &prev, &mut task)?;
        batch.delete_cf(self.cf(CF_DEAD_LETTER)?, task_id.as_bytes());
        batch.delete_cf(self.cf(CF_RESULTS)?, task_id.as_bytes());
        batch.put_cf(
            self.cf(CF_META)?,
            META_NEXT_SEQUENCE,
            (task.sequence + 1).to_be_bytes(),
        );

        self.wal.append(&WalEntry::Replayed {
            task_id: task.id,
            timestamp: now,
        })?;
        self.db.write(batch)?;
        *next_sequence += 1;

        info!(task_id = %task.id, task_type = %task.task_type, "Replayed dead letter");
        Ok(task)
    }

    /// Delete expired results and dead letter entries together with the
    /// terminal task records they describe
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport> {
        let _guard = self.commit_lock.lock();

        let results_cf = self.cf(CF_RESULTS)?;
        let dlq_cf = self.cf(CF_DEAD_LETTER)?;
        let tasks_cf = self.cf(CF_TASKS)?;

        let mut batch = WriteBatch::default();
        let mut report = PurgeReport::default();
        let mut purged_tasks = Vec::new();

        for result in self.scan::<TaskResult>(CF_RESULTS)? {
            if !result.is_expired(now) {
                continue;
            }
            batch.delete_cf(results_cf, result.task_id.as_bytes());
            report.results += 1;

            // Dead tasks stay until their dead letter entry expires
            match self.get_task(&result.task_id)? {
                Some(task) if matches!(task.status, TaskStatus::Completed | TaskStatus::Cancelled) => {
                    purged_tasks.push(task.id);
                }
                _ => {}
            }
        }

        for entry in self.scan::<DeadLetterEntry>(CF_DEAD_LETTER)? {
            if !entry.is_expired(now) {
                continue;
            }
            batch.delete_cf(dlq_cf, entry.task_id.as_bytes());
            report.dead_letters += 1;
            purged_tasks.push(entry.task_id);
        }

        for task_id in &purged_tasks {
            batch.delete_cf(tasks_cf, task_id.as_bytes());
            self.wal.append(&WalEntry::Purged {
                task_id: *task_id,
                timestamp: now,
            })?;
        }
        report.tasks = purged_tasks.len();

        if report != PurgeReport::default() {
            self.db.write(batch)?;
            info!(
                results = report.results,
                dead_letters = report.dead_letters,
                tasks = report.tasks,
                "Purged expired records"
            );
        }
        Ok(report)
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        Ok(self
            .scan::<Task>(CF_TASKS)?
            .into_iter()
            .filter(|task| task.status == status)
            .collect())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for task in self.scan::<Task>(CF_TASKS)? {
            *stats.by_status.entry(task.status).or_insert(0) += 1;
            if task.status.is_queued() {
                *stats.queued_by_type.entry(task.task_type).or_insert(0) += 1;
            }
        }
        stats.dead_letters = self
            .db
            .iterator_cf(self.cf(CF_DEAD_LETTER)?, IteratorMode::Start)
            .count();
        Ok(stats)
    }

    /// Cheap round trip through the database, used as the liveness check
    pub fn ping(&self) -> Result<()> {
        self.db.get_cf(self.cf(CF_META)?, META_NEXT_SEQUENCE)?;
        Ok(())
    }

    pub fn journal(&self) -> &WriteAheadLog {
        &self.wal
    }

    pub fn sync_wal(&self) -> Result<()> {
        self.wal.sync()
    }

    fn scan<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| PersistenceError::Corrupt("expected 8-byte counter".to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::{Priority, ResultStatus};
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store(temp_dir: &TempDir) -> TaskStore {
        TaskStore::open(TaskStoreConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap()
    }

    fn prediction(priority: u8) -> Task {
        Task::new(
            TaskType::MlPrediction,
            json!({ "model_id": "churn", "input_data": { "user": "u1" } }),
            Priority::new(priority),
        )
        .unwrap()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 0,
            max_delay_ms: 0,
            ..RetryPolicy::default()
        }
    }

    fn claim_next(store: &TaskStore, worker: &str) -> Option<Task> {
        let now = Utc::now();
        for (_, task_id) in store.claimable(&TaskType::ALL, now, 16).unwrap() {
            let task = store.get_task(&task_id).unwrap().unwrap();
            if let ClaimOutcome::Claimed(task) = store
                .claim(&task_id, task.version, worker, Duration::seconds(30), now)
                .unwrap()
            {
                return Some(task);
            }
        }
        None
    }

    #[test]
    fn test_submit_and_get_task() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let stored = store.submit(prediction(100)).unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.sequence, 1);

        let retrieved = store.get_task(&stored.id).unwrap().unwrap();
        assert_eq!(retrieved, stored);
        assert_eq!(retrieved.status, TaskStatus::Pending);
    }

    #[test]
    fn test_claimable_orders_by_priority_then_fifo() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let low = store.submit(prediction(10)).unwrap();
        let high_first = store.submit(prediction(100)).unwrap();
        let high_second = store.submit(prediction(100)).unwrap();

        let order: Vec<TaskId> = store
            .claimable(&[TaskType::MlPrediction], Utc::now(), 10)
            .unwrap()
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        assert_eq!(order, vec![high_first.id, high_second.id, low.id]);
        assert!(store.claimable(&[TaskType::Generate3d], Utc::now(), 10).unwrap().is_empty());
    }

    #[test]
    fn test_stale_version_claim_conflicts() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let task = store.submit(prediction(100)).unwrap();
        let now = Utc::now();

        let first = store.claim(&task.id, task.version, "worker-1", Duration::seconds(30), now).unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed(_)));

        let second = store.claim(&task.id, task.version, "worker-2", Duration::seconds(30), now).unwrap();
        assert!(matches!(second, ClaimOutcome::Conflict));

        let current = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(current.claimed_by.as_deref(), Some("worker-1"));
        assert!(store.claimable(&TaskType::ALL, now, 10).unwrap().is_empty());
    }

    #[test]
    fn test_complete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let task = store.submit(prediction(100)).unwrap();
        claim_next(&store, "worker-1").unwrap();

        let output = json!({ "prediction": 0.87 });
        assert!(matches!(
            store.complete(&task.id, "worker-1", output.clone(), Utc::now()).unwrap(),
            CompleteOutcome::Completed(_)
        ));
        let first = store.get_result(&task.id, Utc::now()).unwrap().unwrap();

        assert!(matches!(
            store.complete(&task.id, "worker-1", output, Utc::now()).unwrap(),
            CompleteOutcome::AlreadyFinished(TaskStatus::Completed)
        ));
        let second = store.get_result(&task.id, Utc::now()).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(second.status, ResultStatus::Success);
    }

    #[test]
    fn test_fail_and_retry_task() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let task = store.submit(prediction(100)).unwrap();
        claim_next(&store, "worker-1").unwrap();

        let outcome = store
            .fail(&task.id, "worker-1", TaskFailure::new(ErrorKind::Network, "reset"), &RetryPolicy::default(), Utc::now())
            .unwrap();
        match outcome {
            FailOutcome::Retrying { task, delay } => {
                assert_eq!(task.retry_count, 1);
                assert_eq!(task.status, TaskStatus::Failed);
                assert_eq!(delay, StdDuration::from_secs(10));
            }
            other => panic!("Expected retry, got {:?}", other),
        }

        // Backed off: still indexed but not visible yet
        assert!(store.claimable(&TaskType::ALL, Utc::now(), 10).unwrap().is_empty());
        assert_eq!(store.stats().unwrap().queued_by_type[&TaskType::MlPrediction], 1);
    }

    #[test]
    fn test_task_moves_to_dlq_after_max_retries() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let task = store.submit(prediction(100)).unwrap();

        for attempt in 1..=3 {
            claim_next(&store, "worker-1").unwrap();
            let outcome = store
                .fail(&task.id, "worker-1", TaskFailure::new(ErrorKind::RateLimited, format!("429 #{}", attempt)), &fast_retry(), Utc::now())
                .unwrap();
            if attempt < 3 {
                assert!(matches!(outcome, FailOutcome::Retrying { .. }));
            } else {
                assert!(matches!(outcome, FailOutcome::DeadLettered(_)));
            }
        }

        let dead = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(dead.status, TaskStatus::Dead);
        assert!(claim_next(&store, "worker-1").is_none());

        let entries = store.list_dead_letters(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_count, 3);
        assert_eq!(entries[0].claimed_by.as_deref(), Some("worker-1"));

        let result = store.get_result(&task.id, Utc::now()).unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.payload["error_kind"], "rate_limited");
    }

    #[test]
    fn test_fatal_failure_skips_retries() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let task = store.submit(prediction(100)).unwrap();
        claim_next(&store, "worker-1").unwrap();

        let outcome = store
            .fail(&task.id, "worker-1", TaskFailure::new(ErrorKind::Auth, "401"), &RetryPolicy::default(), Utc::now())
            .unwrap();
        assert!(matches!(outcome, FailOutcome::DeadLettered(ref e) if e.retry_count == 1));
    }

    #[test]
    fn test_fail_on_unclaimed_task_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let task = store.submit(prediction(100)).unwrap();

        let outcome = store
            .fail(&task.id, "worker-1", TaskFailure::new(ErrorKind::Network, "late"), &RetryPolicy::default(), Utc::now())
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Ignored(TaskStatus::Pending)));
    }

    #[test]
    fn test_expired_lease_is_reclaimed() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let task = store.submit(prediction(100)).unwrap();
        claim_next(&store, "worker-1").unwrap();

        let later = Utc::now() + Duration::seconds(31);
        let outcomes = store.reclaim_expired_leases(&fast_retry(), later).unwrap();
        assert_eq!(outcomes.len(), 1);

        let reclaimed = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Failed);
        assert_eq!(reclaimed.last_error.unwrap().kind, ErrorKind::LeaseExpired);
    }

    #[test]
    fn test_late_report_from_previous_holder_is_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let task = store.submit(prediction(100)).unwrap();
        claim_next(&store, "worker-a").unwrap();

        let later = Utc::now() + Duration::seconds(31);
        store.reclaim_expired_leases(&fast_retry(), later).unwrap();
        let reclaimed = store.get_task(&task.id).unwrap().unwrap();
        assert!(matches!(
            store.claim(&task.id, reclaimed.version, "worker-b", Duration::seconds(30), later).unwrap(),
            ClaimOutcome::Claimed(_)
        ));

        let outcome = store
            .fail(&task.id, "worker-a", TaskFailure::new(ErrorKind::Network, "late"), &fast_retry(), later)
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Ignored(TaskStatus::Processing)));
        assert!(matches!(
            store.complete(&task.id, "worker-a", json!({}), later).unwrap(),
            CompleteOutcome::NotOwner(TaskStatus::Processing)
        ));
        assert!(store.finish_cancelled(&task.id, "worker-a", later).unwrap().is_none());

        let current = store.get_task(&task.id).unwrap().unwrap();
        assert!(current.is_held_by("worker-b"));
        assert_eq!(current.retry_count, 1);
        assert!(store.get_result(&task.id, later).unwrap().is_none());
        assert!(store.claimable(&TaskType::ALL, later, 10).unwrap().is_empty());

        assert!(matches!(
            store.complete(&task.id, "worker-b", json!({ "ok": true }), later).unwrap(),
            CompleteOutcome::Completed(_)
        ));
    }

    #[test]
    fn test_complete_requires_a_claim() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let task = store.submit(prediction(100)).unwrap();

        assert!(matches!(
            store.complete(&task.id, "worker-1", json!({}), Utc::now()).unwrap(),
            CompleteOutcome::NotOwner(TaskStatus::Pending)
        ));
        assert_eq!(store.get_task(&task.id).unwrap().unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_failure_after_cancel_request_ends_cancelled() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let task = store.submit(prediction(100)).unwrap();
        claim_next(&store, "worker-1").unwrap();
        assert!(matches!(store.cancel(&task.id, Utc::now()).unwrap(), CancelOutcome::Requested(_)));

        let outcome = store
            .fail(&task.id, "worker-1", TaskFailure::new(ErrorKind::Network, "reset"), &fast_retry(), Utc::now())
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Cancelled(_)));

        let cancelled = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(store.claimable(&TaskType::ALL, Utc::now(), 10).unwrap().is_empty());
        let result = store.get_result(&task.id, Utc::now()).unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::Cancelled);
    }

    #[test]
    fn test_expired_lease_with_cancel_request_ends_cancelled() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let task = store.submit(prediction(100)).unwrap();
        claim_next(&store, "worker-1").unwrap();
        store.cancel(&task.id, Utc::now()).unwrap();

        let later = Utc::now() + Duration::seconds(31);
        let outcomes = store.reclaim_expired_leases(&fast_retry(), later).unwrap();
        assert!(matches!(outcomes[..], [FailOutcome::Cancelled(_)]));
        assert_eq!(store.get_task(&task.id).unwrap().unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_cancel_pending_and_running() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let queued = store.submit(prediction(10)).unwrap();
        let running = store.submit(prediction(100)).unwrap();
        claim_next(&store, "worker-1").unwrap();

        assert!(matches!(store.cancel(&queued.id, Utc::now()).unwrap(), CancelOutcome::Cancelled(_)));
        assert!(claim_next(&store, "worker-2").is_none());

        match store.cancel(&running.id, Utc::now()).unwrap() {
            CancelOutcome::Requested(task) => assert!(task.cancel_requested),
            other => panic!("Expected Requested, got {:?}", other),
        }
        assert!(store.finish_cancelled(&running.id, "worker-2", Utc::now()).unwrap().is_none());
        assert!(store.finish_cancelled(&running.id, "worker-1", Utc::now()).unwrap().is_some());
        let result = store.get_result(&running.id, Utc::now()).unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::Cancelled);
    }

    #[test]
    fn test_replay_dead_letter() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let task = store.submit(prediction(100)).unwrap();
        claim_next(&store, "worker-1").unwrap();
        store
            .fail(&task.id, "worker-1", TaskFailure::new(ErrorKind::Validation, "bad input"), &RetryPolicy::default(), Utc::now())
            .unwrap();

        let replayed = store.replay_dead_letter(&task.id, Utc::now()).unwrap();
        assert_eq!(replayed.status, TaskStatus::Pending);
        assert_eq!(replayed.retry_count, 0);
        assert!(store.get_dead_letter(&task.id).unwrap().is_none());
        assert!(store.get_result(&task.id, Utc::now()).unwrap().is_none());
        assert_eq!(claim_next(&store, "worker-2").unwrap().id, task.id);

        assert!(store.replay_dead_letter(&task.id, Utc::now()).is_err());
    }

    #[test]
    fn test_purge_removes_expired_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let done = store.submit(prediction(100)).unwrap();
        claim_next(&store, "worker-1").unwrap();
        store.complete(&done.id, "worker-1", json!({}), Utc::now()).unwrap();

        let dead = store.submit(prediction(100)).unwrap();
        claim_next(&store, "worker-1").unwrap();
        store
            .fail(&dead.id, "worker-1", TaskFailure::new(ErrorKind::Auth, "401"), &RetryPolicy::default(), Utc::now())
            .unwrap();

        assert_eq!(store.purge_expired(Utc::now()).unwrap(), PurgeReport::default());

        let report = store.purge_expired(Utc::now() + Duration::days(8)).unwrap();
        assert_eq!(report, PurgeReport { results: 2, dead_letters: 1, tasks: 2 });
        assert!(store.get_task(&done.id).unwrap().is_none());
        assert!(store.get_task(&dead.id).unwrap().is_none());
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let first = {
            let store = open_store(&temp_dir);
            store.submit(prediction(100)).unwrap()
        };

        let store = open_store(&temp_dir);
        let second = store.submit(prediction(100)).unwrap();
        assert!(second.sequence > first.sequence);
        store.ping().unwrap();

        let history = store.journal().history(&first.id).unwrap();
        assert!(matches!(history[0], WalEntry::Submitted { .. }));
    }
}
