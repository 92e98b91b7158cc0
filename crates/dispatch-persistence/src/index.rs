//! Key layout of the per-type priority index.
//!
//! `[type code][255 - priority][sequence, big endian]` sorts ascending into
//! highest priority first, then enqueue order, grouped by task type.

use crate::{PersistenceError, Result};
use chrono::{DateTime, TimeZone, Utc};
use dispatch_core::{Priority, Task, TaskId, TaskType};

pub(crate) const KEY_LEN: usize = 10;
const VALUE_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexKey {
    pub task_type: TaskType,
    pub priority: Priority,
    pub sequence: u64,
}

impl IndexKey {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_type: task.task_type,
            priority: task.priority,
            sequence: task.sequence,
        }
    }

    pub fn encode(&self) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        key[0] = self.task_type.code();
        key[1] = self.priority.index_byte();
        key[2..].copy_from_slice(&self.sequence.to_be_bytes());
        key
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            return Err(PersistenceError::Corrupt(format!(
                "index key has {} bytes",
                bytes.len()
            )));
        }
        let task_type = TaskType::from_code(bytes[0]).ok_or_else(|| {
            PersistenceError::Corrupt(format!("unknown task type code {}", bytes[0]))
        })?;
        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&bytes[2..]);
        Ok(Self {
            task_type,
            priority: Priority::from_index_byte(bytes[1]),
            sequence: u64::from_be_bytes(sequence),
        })
    }
}

/// Index value: the task id and the instant it becomes claimable, so scans can
/// skip backed-off tasks without loading their records.
pub(crate) fn encode_value(task_id: &TaskId, visible_at: DateTime<Utc>) -> [u8; VALUE_LEN] {
    let mut value = [0u8; VALUE_LEN];
    value[..16].copy_from_slice(task_id.as_bytes());
    value[16..].copy_from_slice(&visible_at.timestamp_millis().to_be_bytes());
    value
}

pub(crate) fn decode_value(bytes: &[u8]) -> Result<(TaskId, DateTime<Utc>)> {
    if bytes.len() != VALUE_LEN {
        return Err(PersistenceError::Corrupt(format!(
            "index value has {} bytes",
            bytes.len()
        )));
    }
    let task_id = TaskId::from_slice(&bytes[..16])
        .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
    let mut millis = [0u8; 8];
    millis.copy_from_slice(&bytes[16..]);
    let visible_at = Utc
        .timestamp_millis_opt(i64::from_be_bytes(millis))
        .single()
        .ok_or_else(|| PersistenceError::Corrupt("index visibility out of range".to_string()))?;
    Ok((task_id, visible_at))
}
