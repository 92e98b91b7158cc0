use crate::{PersistenceError, Result};
use chrono::{DateTime, Utc};
use dispatch_core::{ErrorKind, Priority, TaskId, TaskType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Journal entry for one task state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WalEntry {
    Submitted {
        task_id: TaskId,
        task_type: TaskType,
        priority: Priority,
        visible_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    Claimed {
        task_id: TaskId,
        worker_id: String,
        version: u64,
        timestamp: DateTime<Utc>,
    },
    Completed {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    RetryScheduled {
        task_id: TaskId,
        error_kind: ErrorKind,
        retry_count: u32,
        visible_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    DeadLettered {
        task_id: TaskId,
        error_kind: ErrorKind,
        retry_count: u32,
        timestamp: DateTime<Utc>,
    },
    CancelRequested {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    Cancelled {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    Replayed {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    Purged {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
}

impl WalEntry {
    pub fn task_id(&self) -> TaskId {
        match self {
            WalEntry::Submitted { task_id, .. }
            | WalEntry::Claimed { task_id, .. }
            | WalEntry::Completed { task_id, .. }
            | WalEntry::RetryScheduled { task_id, .. }
            | WalEntry::DeadLettered { task_id, .. }
            | WalEntry::CancelRequested { task_id, .. }
            | WalEntry::Cancelled { task_id, .. }
            | WalEntry::Replayed { task_id, .. }
            | WalEntry::Purged { task_id, .. } => *task_id,
        }
    }
}

/// Sequence-keyed transition journal kept next to the task store
pub struct WriteAheadLog {
    db: rocksdb::DB,
    sequence_number: Mutex<u64>,
}

impl WriteAheadLog {
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);

        let db = rocksdb::DB::open(&opts, path)?;

        // Resume after the last persisted entry
        let mut iter = db.raw_iterator();
        iter.seek_to_last();
        let sequence_number = match iter.key() {
            Some(key) => decode_seq(key)? + 1,
            None => 0,
        };

        Ok(WriteAheadLog {
            db,
            sequence_number: Mutex::new(sequence_number),
        })
    }

    pub fn append(&self, entry: &WalEntry) -> Result<u64> {
        let mut seq = self.sequence_number.lock();
        let seq_num = *seq;

        self.db.put(seq_num.to_be_bytes(), serde_json::to_vec(entry)?)?;

        *seq += 1;
        Ok(seq_num)
    }

    pub fn get(&self, seq_num: u64) -> Result<Option<WalEntry>> {
        match self.db.get(seq_num.to_be_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn replay_from(&self, start_seq: u64) -> Result<Vec<(u64, WalEntry)>> {
        let mut entries = Vec::new();
        let mut iter = self.db.raw_iterator();

        iter.seek(start_seq.to_be_bytes());

        while iter.valid() {
            if let (Some(key), Some(value)) = (iter.key(), iter.value()) {
                entries.push((decode_seq(key)?, serde_json::from_slice(value)?));
            }
            iter.next();
        }
        iter.status()?;

        Ok(entries)
    }

    /// Every journaled transition of one task, oldest first
    pub fn history(&self, task_id: &TaskId) -> Result<Vec<WalEntry>> {
        Ok(self
            .replay_from(0)?
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.task_id() == *task_id)
            .collect())
    }

    pub fn next_sequence(&self) -> u64 {
        *self.sequence_number.lock()
    }

    /// Drop everything except the newest `keep_last_n` entries
    pub fn compact(&self, keep_last_n: u64) -> Result<u64> {
        let current_seq = *self.sequence_number.lock();
        if current_seq <= keep_last_n {
            return Ok(0);
        }

        let cutoff = current_seq - keep_last_n;
        let mut batch = rocksdb::WriteBatch::default();
        let mut removed = 0;
        let mut iter = self.db.raw_iterator();
        iter.seek_to_first();
        while let Some(key) = iter.key() {
            if decode_seq(key)? >= cutoff {
                break;
            }
            batch.delete(key);
            removed += 1;
            iter.next();
        }
        iter.status()?;
        drop(iter);

        self.db.write(batch)?;
        Ok(removed)
    }

    pub fn sync(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_seq(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| PersistenceError::WalError("Invalid key format".to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}
