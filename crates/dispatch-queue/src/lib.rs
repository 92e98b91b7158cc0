pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;

pub use config::QueueConfig;
pub use error::{QueueError, Result};
pub use metrics::QueueMetrics;
pub use queue::{EnqueueOptions, MaintenanceReport, ResultLookup, TaskQueue};

pub use dispatch_persistence::{CancelOutcome, FailOutcome, StoreStats};
