mod task;
mod task_type;
mod priority;
mod payload;
mod record;
mod retry;
mod error;

pub use task::{Task, TaskBuilder, TaskFailure, TaskId, TaskStatus};
pub use task_type::TaskType;
pub use priority::Priority;
pub use payload::{
    CampaignType, MarketingCampaignInput, MlPredictionInput, MlTrainingInput,
    ThreeDGenerationInput,
};
pub use record::{DeadLetterEntry, ResultStatus, TaskResult};
pub use retry::{ErrorClass, ErrorKind, RetryDecision, RetryPolicy};
pub use error::{Result, TaskError, ValidationError};

pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Default number of task-level retries before dead-lettering
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Dead letter entries are kept for operator inspection for 7 days
pub const DEAD_LETTER_TTL_SECS: i64 = 7 * 24 * 60 * 60;
