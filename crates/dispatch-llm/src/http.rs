//! reqwest-backed [`ProviderClient`] speaking either the OpenAI chat
//! completions dialect or the Anthropic messages dialect.

use crate::{
    ChunkStream, CompletionOptions, Message, ProviderClient, ProviderEndpoint, ProviderError,
    ProviderId, Response, Role, StreamChunk, TokenUsage, ToolCall, WireFormat,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use bytes::{Bytes, BytesMut};
use dispatch_core::{ErrorClass, ErrorKind, RetryDecision};
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct HttpProviderClient {
    provider: ProviderId,
    endpoint: ProviderEndpoint,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpProviderClient {
    /// Build a client, reading the API key from the endpoint's env variable
    pub fn new(provider: ProviderId, endpoint: ProviderEndpoint) -> Self {
        let api_key = std::env::var(&endpoint.api_key_env).ok();
        Self::with_api_key(provider, endpoint, api_key)
    }

    pub fn with_api_key(provider: ProviderId, endpoint: ProviderEndpoint, api_key: Option<String>) -> Self {
        Self {
            provider,
            endpoint,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn request_body(&self, messages: &[Message], model: &str, options: &CompletionOptions, stream: bool) -> Value {
        match self.endpoint.wire_format {
            WireFormat::OpenAiChat => {
                let mut body = json!({
                    "model": model,
                    "messages": messages
                        .iter()
                        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
                        .collect::<Vec<_>>(),
                    "max_tokens": options.max_tokens,
                    "stream": stream,
                });
                if let Some(temperature) = options.temperature {
                    body["temperature"] = json!(temperature);
                }
                if !options.tools.is_empty() {
                    body["tools"] = options
                        .tools
                        .iter()
                        .map(|t| {
                            json!({
                                "type": "function",
                                "function": {
                                    "name": t.name,
                                    "description": t.description,
                                    "parameters": t.parameters,
                                }
                            })
                        })
                        .collect();
                }
                body
            }
            WireFormat::AnthropicMessages => {
                let system = messages
                    .iter()
                    .filter(|m| m.role == Role::System)
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                let mut body = json!({
                    "model": model,
                    "messages": messages
                        .iter()
                        .filter(|m| m.role != Role::System)
                        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
                        .collect::<Vec<_>>(),
                    "max_tokens": options.max_tokens,
                    "stream": stream,
                });
                if !system.is_empty() {
                    body["system"] = json!(system);
                }
                if let Some(temperature) = options.temperature {
                    body["temperature"] = json!(temperature);
                }
                if !options.tools.is_empty() {
                    body["tools"] = options
                        .tools
                        .iter()
                        .map(|t| {
                            json!({
                                "name": t.name,
                                "description": t.description,
                                "input_schema": t.parameters,
                            })
                        })
                        .collect();
                }
                body
            }
        }
    }

    /// One HTTP round trip; returns the response once the status is 2xx
    async fn send(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let mut request = self
            .client
            .post(self.endpoint.url())
            .timeout(self.endpoint.request_timeout())
            .json(body);

        if let Some(key) = &self.api_key {
            request = match self.endpoint.wire_format {
                WireFormat::OpenAiChat => request.bearer_auth(key),
                WireFormat::AnthropicMessages => request
                    .header("x-api-key", key)
                    .header("anthropic-version", "2023-06-01"),
            };
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();
        Err(self.status_error(status, retry_after, text))
    }

    /// Send with the endpoint's retry policy applied to transient failures
    async fn send_with_retry(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let policy = &self.endpoint.retry;
        let mut failures = 0;

        loop {
            let err = match self.send(body).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            failures += 1;

            let class = if err.is_transient() { ErrorClass::Transient } else { ErrorClass::Fatal };
            match policy.decide(class, failures) {
                RetryDecision::Retry { delay } => {
                    let cap = Duration::from_millis(policy.max_delay_ms);
                    let wait = match err.retry_after() {
                        // Let the caller fail over instead of stalling here
                        Some(hint) if hint > cap => {
                            warn!(
                                provider = %self.provider,
                                retry_after_secs = hint.as_secs(),
                                "Provider asked for a longer wait than the retry policy allows"
                            );
                            return Err(err);
                        }
                        Some(hint) => hint,
                        None => policy.jittered(delay),
                    };
                    warn!(
                        provider = %self.provider,
                        attempt = failures,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "Retrying provider call"
                    );
                    tokio::time::sleep(wait).await;
                }
                RetryDecision::GiveUp => return Err(err),
            }
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> ProviderError {
        let message = if e.is_timeout() {
            format!("request timed out after {:?}", self.endpoint.request_timeout())
        } else {
            e.to_string()
        };
        ProviderError::transient(self.provider, ErrorKind::Network, message)
    }

    fn status_error(&self, status: StatusCode, retry_after: Option<Duration>, body: String) -> ProviderError {
        let message = format!("HTTP {}: {}", status.as_u16(), truncate(&body, 512));
        match status {
            StatusCode::TOO_MANY_REQUESTS => ProviderError::Transient {
                provider: self.provider,
                kind: ErrorKind::RateLimited,
                message,
                retry_after,
            },
            StatusCode::REQUEST_TIMEOUT => ProviderError::transient(self.provider, ErrorKind::Network, message),
            s if s.is_server_error() => ProviderError::Transient {
                provider: self.provider,
                kind: ErrorKind::ProviderUnavailable,
                message,
                retry_after,
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ProviderError::fatal(self.provider, ErrorKind::Auth, message)
            }
            _ => ProviderError::fatal(self.provider, ErrorKind::ProviderRejected, message),
        }
    }

    fn parse_completion(&self, body: &str, model: &str, latency: Duration) -> Result<Response, ProviderError> {
        let malformed =
            |e: serde_json::Error| ProviderError::transient(self.provider, ErrorKind::ProviderUnavailable, format!("malformed response: {}", e));

        let (content, tool_calls, token_usage) = match self.endpoint.wire_format {
            WireFormat::OpenAiChat => {
                let parsed: OpenAiResponse = serde_json::from_str(body).map_err(malformed)?;
                let message = parsed.choices.into_iter().next().map(|c| c.message).unwrap_or_default();
                let tool_calls = message
                    .tool_calls
                    .into_iter()
                    .map(|call| ToolCall {
                        id: call.id,
                        name: call.function.name,
                        arguments: serde_json::from_str(&call.function.arguments)
                            .unwrap_or(Value::String(call.function.arguments)),
                    })
                    .collect();
                let usage = parsed.usage.unwrap_or_default();
                (
                    message.content.unwrap_or_default(),
                    tool_calls,
                    TokenUsage {
                        input_tokens: usage.prompt_tokens,
                        output_tokens: usage.completion_tokens,
                    },
                )
            }
            WireFormat::AnthropicMessages => {
                let parsed: AnthropicResponse = serde_json::from_str(body).map_err(malformed)?;
                let mut text = String::new();
                let mut tool_calls = Vec::new();
                for block in parsed.content {
                    match block {
                        AnthropicBlock::Text { text: t } => text.push_str(&t),
                        AnthropicBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                            id,
                            name,
                            arguments: input,
                        }),
                        AnthropicBlock::Other => {}
                    }
                }
                (
                    text,
                    tool_calls,
                    TokenUsage {
                        input_tokens: parsed.usage.input_tokens,
                        output_tokens: parsed.usage.output_tokens,
                    },
                )
            }
        };

        Ok(Response {
            provider: self.provider,
            model: model.to_string(),
            content,
            token_usage,
            latency,
            tool_calls,
            estimated_cost_usd: None,
        })
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn provider(&self) -> ProviderId {
        self.provider
    }

    async fn complete(
        &self,
        messages: &[Message],
        model: &str,
        options: &CompletionOptions,
    ) -> Result<Response, ProviderError> {
        let started = Instant::now();
        let body = self.request_body(messages, model, options, false);
        let response = self.send_with_retry(&body).await?;
        let text = response.text().await.map_err(|e| self.transport_error(e))?;

        let response = self.parse_completion(&text, model, started.elapsed())?;
        debug!(
            provider = %self.provider,
            model = model,
            input_tokens = response.token_usage.input_tokens,
            output_tokens = response.token_usage.output_tokens,
            latency_ms = response.latency.as_millis() as u64,
            "Completion received"
        );
        Ok(response)
    }

    async fn stream(
        &self,
        messages: &[Message],
        model: &str,
        options: &CompletionOptions,
    ) -> Result<ChunkStream, ProviderError> {
        let body = self.request_body(messages, model, options, true);
        let response = self.send_with_retry(&body).await?;

        let state = SseState {
            provider: self.provider,
            format: self.endpoint.wire_format,
            body: Box::pin(response.bytes_stream()),
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
            finished: false,
        };

        Ok(Box::pin(futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.finished {
                    return None;
                }
                match state.body.next().await {
                    Some(Ok(bytes)) => state.feed(&bytes),
                    Some(Err(e)) => {
                        state.finished = true;
                        state.pending.push_back(Err(ProviderError::transient(
                            state.provider,
                            ErrorKind::Network,
                            format!("stream interrupted: {}", e),
                        )));
                    }
                    None => {
                        state.feed(b"\n");
                        state.finished = true;
                    }
                }
            }
        })))
    }
}

/// Server-sent events decoder state
struct SseState {
    provider: ProviderId,
    format: WireFormat,
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    /// Raw bytes of the unfinished line; decoded only once the line is whole
    buffer: BytesMut,
    pending: VecDeque<Result<StreamChunk, ProviderError>>,
    finished: bool,
}

impl SseState {
    fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        self.drain_lines();
    }

    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw = self.buffer.split_to(pos + 1);
            let line = match std::str::from_utf8(&raw) {
                Ok(line) => line.trim(),
                Err(e) => {
                    debug!(provider = %self.provider, error = %e, "Skipping non-UTF-8 SSE line");
                    continue;
                }
            };
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.finished = true;
                self.buffer.clear();
                return;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(event) => self.handle_event(&event),
                Err(e) => debug!(provider = %self.provider, error = %e, "Skipping undecodable SSE line"),
            }
        }
    }

    fn handle_event(&mut self, event: &Value) {
        match self.format {
            WireFormat::OpenAiChat => {
                if let Some(delta) = event["choices"][0]["delta"]["content"].as_str() {
                    if !delta.is_empty() {
                        self.pending.push_back(Ok(StreamChunk {
                            delta: delta.to_string(),
                            usage: None,
                        }));
                    }
                }
                if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
                    self.pending.push_back(Ok(StreamChunk {
                        delta: String::new(),
                        usage: Some(TokenUsage {
                            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
                        }),
                    }));
                }
            }
            WireFormat::AnthropicMessages => match event["type"].as_str() {
                Some("content_block_delta") => {
                    if let Some(text) = event["delta"]["text"].as_str() {
                        self.pending.push_back(Ok(StreamChunk {
                            delta: text.to_string(),
                            usage: None,
                        }));
                    }
                }
                Some("message_stop") => self.finished = true,
                Some("error") => {
                    self.finished = true;
                    self.pending.push_back(Err(ProviderError::transient(
                        self.provider,
                        ErrorKind::ProviderUnavailable,
                        event["error"]["message"].as_str().unwrap_or("stream error").to_string(),
                    )));
                }
                _ => {}
            },
        }
    }
}

/// `Retry-After` as delta-seconds or an HTTP-date
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some((at.with_timezone(&Utc) - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize, Default)]
struct OpenAiMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Deserialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize, Default)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
