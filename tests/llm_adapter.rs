//! HTTP-level tests for the streaming LLM adapter against a mock
//! OpenAI-compatible server.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use remdis::config::ChatGptConfig;
use remdis::error::RemdisError;
use remdis::llm::{ChatGptAdapter, GenerationRequest, run_generation};

fn sse_delta(content: &str) -> String {
    let chunk = serde_json::json!({
        "choices": [{"delta": {"content": content}}]
    });
    format!("data: {chunk}\n\n")
}

fn sse_stop() -> String {
    let chunk = serde_json::json!({
        "choices": [{"delta": {}, "finish_reason": "stop"}]
    });
    format!("data: {chunk}\n\ndata: [DONE]\n\n")
}

fn config_for(server: &MockServer, api_key: &str) -> ChatGptConfig {
    ChatGptConfig {
        api_url: server.uri(),
        api_model: "test-model".to_owned(),
        api_key: api_key.to_owned(),
        ..ChatGptConfig::default()
    }
}

fn request(timeout: Duration) -> GenerationRequest {
    GenerationRequest {
        prompt: "tell me a joke".to_owned(),
        generation_id: 1,
        cancel: CancellationToken::new(),
        first_token_timeout: timeout,
        max_tokens: 64,
        temperature: 0.7,
    }
}

async fn collect(
    adapter: ChatGptAdapter,
    req: GenerationRequest,
) -> (Vec<String>, Result<(), RemdisError>) {
    let (tx, mut rx) = mpsc::channel(32);
    let driver = tokio::spawn(run_generation(Arc::new(adapter), req, tx));
    let mut tokens = Vec::new();
    while let Some(t) = rx.recv().await {
        tokens.push(t);
    }
    let result = driver.await.expect("driver task");
    (tokens, result)
}

#[tokio::test]
async fn streams_tokens_in_order() {
    let server = MockServer::start().await;
    let body = format!(
        "{}{}{}{}",
        sse_delta("Why did"),
        sse_delta(" the chicken"),
        sse_delta(" cross the road?"),
        sse_stop()
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("tell me a joke"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = ChatGptAdapter::new(&config_for(&server, ""));
    let (tokens, result) = collect(adapter, request(Duration::from_secs(2))).await;

    result.expect("generation succeeds");
    assert_eq!(tokens, vec!["Why did", " the chicken", " cross the road?"]);
}

#[tokio::test]
async fn sends_bearer_token_when_configured() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer sk-test"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(format!("{}{}", sse_delta("ok"), sse_stop()), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let adapter = ChatGptAdapter::new(&config_for(&server, "sk-test"));
    let (tokens, result) = collect(adapter, request(Duration::from_secs(2))).await;
    result.expect("generation succeeds");
    assert_eq!(tokens, vec!["ok"]);
}

#[tokio::test]
async fn slow_first_token_fails_with_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(5))
                .set_body_raw(format!("{}{}", sse_delta("late"), sse_stop()), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let adapter = ChatGptAdapter::new(&config_for(&server, ""));
    let (tokens, result) = collect(adapter, request(Duration::from_millis(200))).await;

    assert!(tokens.is_empty(), "no token may be forwarded: {tokens:?}");
    assert!(matches!(result, Err(RemdisError::LlmTimeout(_))));
}

#[tokio::test]
async fn http_error_fails_the_generation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let adapter = ChatGptAdapter::new(&config_for(&server, ""));
    let (tokens, result) = collect(adapter, request(Duration::from_secs(2))).await;

    assert!(tokens.is_empty());
    assert!(matches!(result, Err(RemdisError::LlmFailed(_))));
}

#[tokio::test]
async fn malformed_sse_payload_fails_cleanly() {
    let server = MockServer::start().await;
    let body = format!("{}data: {{ not json\n\n", sse_delta("first"));
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let adapter = ChatGptAdapter::new(&config_for(&server, ""));
    let (tokens, result) = collect(adapter, request(Duration::from_secs(2))).await;

    // The well-formed prefix is delivered; the stream then fails.
    assert_eq!(tokens, vec!["first"]);
    assert!(matches!(result, Err(RemdisError::LlmFailed(_))));
}

#[tokio::test]
async fn finish_reason_ends_the_stream_without_done_marker() {
    let server = MockServer::start().await;
    let chunk = serde_json::json!({
        "choices": [{"delta": {"content": "done"}, "finish_reason": "stop"}]
    });
    let body = format!("data: {chunk}\n\n");
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let adapter = ChatGptAdapter::new(&config_for(&server, ""));
    let (tokens, result) = collect(adapter, request(Duration::from_secs(2))).await;

    result.expect("generation succeeds");
    assert_eq!(tokens, vec!["done"]);
}
