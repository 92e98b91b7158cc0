pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod handler;
pub mod llm_handler;
pub mod pool;
pub mod worker;

pub use config::WorkerConfig;
pub use context::TaskContext;
pub use error::HandlerError;
pub use executor::TaskExecutor;
pub use handler::{HandlerRegistry, TaskHandler};
pub use llm_handler::LlmTaskHandler;
pub use pool::WorkerPool;
pub use worker::Worker;
