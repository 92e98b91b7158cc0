use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use dispatch_core::{ErrorKind, RetryPolicy};
use dispatch_llm::{
    CompletionOptions, HttpProviderClient, Message, ProviderClient, ProviderEndpoint, ProviderError,
    ProviderId, ToolSpec, WireFormat,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

/// Scripted upstream: answers the n-th call with `script[n]`, repeating the
/// last entry, and records every request
#[derive(Clone, Default)]
struct Upstream {
    script: Arc<Vec<(u16, Vec<(&'static str, &'static str)>, String)>>,
    requests: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
}

impl Upstream {
    fn new(script: Vec<(u16, Vec<(&'static str, &'static str)>, String)>) -> Self {
        Self {
            script: Arc::new(script),
            requests: Arc::default(),
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

async fn handle(State(upstream): State<Upstream>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let n = {
        let mut requests = upstream.requests.lock();
        requests.push((headers, body));
        requests.len() - 1
    };
    let (status, extra, body) = upstream.script[n.min(upstream.script.len() - 1)].clone();

    let mut response = (StatusCode::from_u16(status).unwrap(), body).into_response();
    for (name, value) in extra {
        response.headers_mut().insert(name, value.parse().unwrap());
    }
    response
}

async fn serve(upstream: Upstream) -> String {
    let app = Router::new()
        .route("/chat/completions", post(handle))
        .route("/messages", post(handle))
        .with_state(upstream);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn endpoint(base_url: String, wire_format: WireFormat) -> ProviderEndpoint {
    ProviderEndpoint {
        base_url,
        wire_format,
        api_key_env: "UNUSED".to_string(),
        request_timeout_secs: 5,
        retry: RetryPolicy {
            base_delay_ms: 1,
            max_delay_ms: 5,
            max_retries: 3,
            jitter: 0.0,
            retry_timeouts: true,
        },
    }
}

async fn openai_client(upstream: &Upstream) -> HttpProviderClient {
    let base = serve(upstream.clone()).await;
    HttpProviderClient::with_api_key(
        ProviderId::OpenAi,
        endpoint(base, WireFormat::OpenAiChat),
        Some("test-key".to_string()),
    )
}

fn ok_completion(content: &str) -> (u16, Vec<(&'static str, &'static str)>, String) {
    (
        200,
        vec![("content-type", "application/json")],
        json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 7 }
        })
        .to_string(),
    )
}

fn status(code: u16) -> (u16, Vec<(&'static str, &'static str)>, String) {
    (code, vec![], format!("upstream said {}", code))
}

#[tokio::test]
async fn test_openai_completion() {
    let upstream = Upstream::new(vec![ok_completion("Bold spring copy")]);
    let client = openai_client(&upstream).await;

    let messages = vec![Message::system("You write copy"), Message::user("Spring sale")];
    let response = client
        .complete(&messages, "gpt-4o-mini", &CompletionOptions::default())
        .await
        .unwrap();

    assert_eq!(response.provider, ProviderId::OpenAi);
    assert_eq!(response.model, "gpt-4o-mini");
    assert_eq!(response.content, "Bold spring copy");
    assert_eq!(response.token_usage.input_tokens, 12);
    assert_eq!(response.token_usage.output_tokens, 7);

    let requests = upstream.requests.lock();
    let (headers, body) = &requests[0];
    assert_eq!(headers["authorization"], "Bearer test-key");
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["stream"], false);
}

#[tokio::test]
async fn test_tool_calls_are_decoded() {
    let body = json!({
        "choices": [{ "message": {
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": { "name": "lookup_sku", "arguments": "{\"sku\":\"TEE-01\"}" }
            }]
        }}],
        "usage": { "prompt_tokens": 3, "completion_tokens": 2 }
    });
    let upstream = Upstream::new(vec![(200, vec![("content-type", "application/json")], body.to_string())]);
    let client = openai_client(&upstream).await;

    let options = CompletionOptions {
        tools: vec![ToolSpec {
            name: "lookup_sku".into(),
            description: "Find a product".into(),
            parameters: json!({ "type": "object" }),
        }],
        ..Default::default()
    };
    let response = client
        .complete(&[Message::user("find TEE-01")], "gpt-4o", &options)
        .await
        .unwrap();

    assert_eq!(response.content, "");
    assert_eq!(response.tool_calls[0].name, "lookup_sku");
    assert_eq!(response.tool_calls[0].arguments, json!({ "sku": "TEE-01" }));
    assert_eq!(upstream.requests.lock()[0].1["tools"][0]["function"]["name"], "lookup_sku");
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let upstream = Upstream::new(vec![status(503), status(502), ok_completion("recovered")]);
    let client = openai_client(&upstream).await;

    let response = client
        .complete(&[Message::user("hi")], "gpt-4o-mini", &CompletionOptions::default())
        .await
        .unwrap();

    assert_eq!(response.content, "recovered");
    assert_eq!(upstream.calls(), 3);
}

#[tokio::test]
async fn test_rate_limit_honors_retry_after() {
    let upstream = Upstream::new(vec![
        (429, vec![("retry-after", "0")], "slow down".to_string()),
        ok_completion("after the wait"),
    ]);
    let client = openai_client(&upstream).await;

    let response = client
        .complete(&[Message::user("hi")], "gpt-4o-mini", &CompletionOptions::default())
        .await
        .unwrap();
    assert_eq!(response.content, "after the wait");
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test]
async fn test_long_retry_after_returns_for_failover() {
    let upstream = Upstream::new(vec![
        (429, vec![("retry-after", "3600")], "come back later".to_string()),
        ok_completion("too late"),
    ]);
    let client = openai_client(&upstream).await;

    let started = std::time::Instant::now();
    let err = client
        .complete(&[Message::user("hi")], "gpt-4o-mini", &CompletionOptions::default())
        .await
        .unwrap_err();

    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert_eq!(err.kind(), ErrorKind::RateLimited);
    assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(3600)));
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn test_retries_exhausted_surface_transient_error() {
    let upstream = Upstream::new(vec![status(503)]);
    let client = openai_client(&upstream).await;

    let err = client
        .complete(&[Message::user("hi")], "gpt-4o-mini", &CompletionOptions::default())
        .await
        .unwrap_err();

    assert!(err.is_transient());
    assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
    assert_eq!(upstream.calls(), 3);
}

#[tokio::test]
async fn test_auth_failure_is_fatal_and_not_retried() {
    let upstream = Upstream::new(vec![status(401)]);
    let client = openai_client(&upstream).await;

    let err = client
        .complete(&[Message::user("hi")], "gpt-4o-mini", &CompletionOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::Fatal { kind: ErrorKind::Auth, .. }));
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn test_bad_request_is_fatal() {
    let upstream = Upstream::new(vec![status(400)]);
    let client = openai_client(&upstream).await;

    let err = client
        .complete(&[Message::user("hi")], "gpt-4o-mini", &CompletionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderRejected);
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_anthropic_messages_dialect() {
    let body = json!({
        "content": [
            { "type": "text", "text": "A heavyweight " },
            { "type": "text", "text": "black tee" }
        ],
        "usage": { "input_tokens": 20, "output_tokens": 4 }
    });
    let upstream = Upstream::new(vec![(200, vec![("content-type", "application/json")], body.to_string())]);
    let base = serve(upstream.clone()).await;
    let client = HttpProviderClient::with_api_key(
        ProviderId::Anthropic,
        endpoint(base, WireFormat::AnthropicMessages),
        Some("sk-ant".to_string()),
    );

    let messages = vec![Message::system("Describe garments"), Message::user("black tee")];
    let response = client
        .complete(&messages, "claude-sonnet-4-20250514", &CompletionOptions::default())
        .await
        .unwrap();

    assert_eq!(response.content, "A heavyweight black tee");
    assert_eq!(response.token_usage.total(), 24);

    let requests = upstream.requests.lock();
    let (headers, body) = &requests[0];
    assert_eq!(headers["x-api-key"], "sk-ant");
    assert_eq!(body["system"], "Describe garments");
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    assert_eq!(body["messages"][0]["role"], "user");
}

#[tokio::test]
async fn test_openai_stream() {
    let sse = [
        r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
        r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#,
        r#"data: {"choices":[{"delta":{"content":" world"}}]}"#,
        "data: [DONE]",
        "",
    ]
    .join("\n\n");
    let upstream = Upstream::new(vec![(200, vec![("content-type", "text/event-stream")], sse)]);
    let client = openai_client(&upstream).await;

    let stream = client
        .stream(&[Message::user("hi")], "gpt-4o-mini", &CompletionOptions::default())
        .await
        .unwrap();
    let chunks: Vec<_> = stream.collect().await;

    let text: String = chunks.into_iter().map(|c| c.unwrap().delta).collect();
    assert_eq!(text, "Hello world");
    assert_eq!(upstream.requests.lock()[0].1["stream"], true);
}

#[tokio::test]
async fn test_anthropic_stream() {
    let sse = [
        "event: message_start\ndata: {\"type\":\"message_start\"}",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Mesh \"}}",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"ready\"}}",
        "event: message_stop\ndata: {\"type\":\"message_stop\"}",
        "",
    ]
    .join("\n\n");
    let upstream = Upstream::new(vec![(200, vec![("content-type", "text/event-stream")], sse)]);
    let base = serve(upstream.clone()).await;
    let client = HttpProviderClient::with_api_key(
        ProviderId::Anthropic,
        endpoint(base, WireFormat::AnthropicMessages),
        None,
    );

    let stream = client
        .stream(&[Message::user("status?")], "claude-sonnet-4-20250514", &CompletionOptions::default())
        .await
        .unwrap();
    let text: String = stream.map(|c| c.unwrap().delta).collect().await;
    assert_eq!(text, "Mesh ready");
}

#[tokio::test]
async fn test_stream_open_failure_is_returned_before_chunks() {
    let upstream = Upstream::new(vec![status(403)]);
    let client = openai_client(&upstream).await;

    let result = client
        .stream(&[Message::user("hi")], "gpt-4o-mini", &CompletionOptions::default())
        .await;
    let err = result.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Auth);
}
