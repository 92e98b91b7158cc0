//! Provider routing for LLM-backed task handlers.
//!
//! A [`LlmOrchestrator`] turns a task type and optional domain hint into an
//! ordered candidate list of (provider, model) pairs and fails over across
//! [`ProviderClient`]s, skipping providers whose circuit is open.

mod circuit;
mod config;
mod error;
mod http;
mod orchestrator;
mod provider;
mod router;
mod types;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState, ProviderStatus};
pub use config::{
    Domain, DomainConfig, ModelProfile, ModelRef, ProviderEndpoint, ProviderProfile,
    RoutingConfig, TaskRoute, WireFormat,
};
pub use error::{ConfigError, FailedAttempt, OrchestrationError, ProviderError};
pub use http::HttpProviderClient;
pub use orchestrator::LlmOrchestrator;
pub use provider::{ChunkStream, ProviderClient, ProviderId};
pub use router::{DomainHint, DomainRouter};
pub use types::{
    CompletionOptions, Message, Response, Role, StreamChunk, TokenUsage, ToolCall, ToolSpec,
};
