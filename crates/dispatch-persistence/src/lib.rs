mod index;
mod store;
mod wal;

pub use index::IndexKey;
pub use store::{
    CancelOutcome, ClaimOutcome, CompleteOutcome, FailOutcome, PurgeReport, StoreStats,
    TaskStore, TaskStoreConfig,
};
pub use wal::{WalEntry, WriteAheadLog};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),

    #[error("Task error: {0}")]
    TaskError(#[from] dispatch_core::TaskError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(dispatch_core::TaskId),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("WAL error: {0}")]
    WalError(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
