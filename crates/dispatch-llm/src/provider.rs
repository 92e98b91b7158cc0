use crate::{CompletionOptions, Message, ProviderError, Response, StreamChunk};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

/// Vendor backends the router can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Anthropic,
    OpenAi,
    Google,
    Mistral,
    Groq,
    Cohere,
    DeepSeek,
}

impl ProviderId {
    pub const ALL: [ProviderId; 7] = [
        ProviderId::Anthropic,
        ProviderId::OpenAi,
        ProviderId::Google,
        ProviderId::Mistral,
        ProviderId::Groq,
        ProviderId::Cohere,
        ProviderId::DeepSeek,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Anthropic => "anthropic",
            ProviderId::OpenAi => "openai",
            ProviderId::Google => "google",
            ProviderId::Mistral => "mistral",
            ProviderId::Groq => "groq",
            ProviderId::Cohere => "cohere",
            ProviderId::DeepSeek => "deepseek",
        }
    }

    /// Slot in per-provider arrays
    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderId::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown provider: {}", s))
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Uniform completion contract over one vendor's API.
///
/// Implementations retry transient failures internally and surface anything
/// left over as a classified [`ProviderError`].
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> ProviderId;

    async fn complete(
        &self,
        messages: &[Message],
        model: &str,
        options: &CompletionOptions,
    ) -> Result<Response, ProviderError>;

    /// Open a streamed completion. Errors before the first chunk are returned
    /// here; errors mid-stream arrive as stream items.
    async fn stream(
        &self,
        messages: &[Message],
        model: &str,
        options: &CompletionOptions,
    ) -> Result<ChunkStream, ProviderError>;
}
