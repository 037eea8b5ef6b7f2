//! Streaming LLM adapter over an OpenAI-compatible chat completions API.
//!
//! Responses stream via Server-Sent Events (SSE) for low-latency token
//! delivery to the dialogue controller. The blocking HTTP read runs on a
//! `spawn_blocking` thread and is bridged to async through a channel.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ChatGptConfig;
use crate::error::{RemdisError, Result};

/// One streaming generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Fully rendered prompt (history snapshot plus user draft).
    pub prompt: String,
    /// Controller-assigned id, echoed back in events for stale filtering.
    pub generation_id: u64,
    /// Cooperative cancellation; honored within one token.
    pub cancel: CancellationToken,
    /// Deadline for the first token.
    pub first_token_timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A token-stream producer. Implementations push raw tokens into `tx` in
/// stream order, stop within one token of cancellation, and return once the
/// stream ends or fails. They do not enforce the first-token deadline; that
/// belongs to [`run_generation`].
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest, tx: mpsc::Sender<String>) -> Result<()>;
}

/// Drive one generation end to end: enforce the first-token deadline, then
/// forward tokens until the stream ends or the cancel token fires.
///
/// Cancellation is not an error; the caller decided to stop listening.
///
/// # Errors
///
/// `LlmTimeout` when no token arrives within the deadline, `LlmFailed` when
/// the underlying stream fails.
pub async fn run_generation(
    generator: Arc<dyn ResponseGenerator>,
    request: GenerationRequest,
    out: mpsc::Sender<String>,
) -> Result<()> {
    let cancel = request.cancel.clone();
    let deadline = request.first_token_timeout;
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let producer = {
        let request = request.clone();
        tokio::spawn(async move { generator.generate(request, tx).await })
    };

    // First token runs against the deadline.
    let first = tokio::select! {
        () = cancel.cancelled() => {
            producer.abort();
            return Ok(());
        }
        token = tokio::time::timeout(deadline, rx.recv()) => match token {
            Err(_) => {
                cancel.cancel();
                producer.abort();
                return Err(RemdisError::LlmTimeout(deadline.as_secs_f64()));
            }
            Ok(token) => token,
        },
    };

    let mut next = first;
    while let Some(token) = next {
        if cancel.is_cancelled() {
            producer.abort();
            return Ok(());
        }
        if out.send(token).await.is_err() {
            producer.abort();
            return Err(RemdisError::Channel("generation output closed".to_owned()));
        }
        next = tokio::select! {
            () = cancel.cancelled() => {
                producer.abort();
                return Ok(());
            }
            token = rx.recv() => token,
        };
    }

    match producer.await {
        Ok(result) => result,
        Err(e) => Err(RemdisError::LlmFailed(format!("generation task died: {e}"))),
    }
}

/// Collect a whole (non-streamed to the caller) response as one string.
/// Used by the Text-VAP adapter, which parses the full reply.
pub async fn collect_response(
    generator: Arc<dyn ResponseGenerator>,
    request: GenerationRequest,
) -> Result<String> {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let driver = tokio::spawn(run_generation(generator, request, tx));
    let mut text = String::new();
    while let Some(token) = rx.recv().await {
        text.push_str(&token);
    }
    driver
        .await
        .map_err(|e| RemdisError::LlmFailed(format!("collector task died: {e}")))??;
    Ok(text)
}

/// LLM backend speaking the OpenAI chat completions protocol.
///
/// Works against api.openai.com as well as any compatible local server
/// (Ollama, vLLM, llama.cpp server).
pub struct ChatGptAdapter {
    config: ChatGptConfig,
    agent: ureq::Agent,
}

impl ChatGptAdapter {
    pub fn new(config: &ChatGptConfig) -> Self {
        info!(
            "LLM adapter configured: {} model={}",
            config.api_url, config.api_model
        );
        Self {
            config: config.clone(),
            agent: ureq::agent(),
        }
    }

    fn completions_url(&self) -> String {
        let base = self
            .config
            .api_url
            .strip_suffix("/v1")
            .unwrap_or(&self.config.api_url);
        format!("{}/v1/chat/completions", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl ResponseGenerator for ChatGptAdapter {
    async fn generate(&self, request: GenerationRequest, tx: mpsc::Sender<String>) -> Result<()> {
        let body = serde_json::json!({
            "model": self.config.api_model,
            "messages": [{"role": "user", "content": request.prompt}],
            "stream": true,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        let body_str = serde_json::to_string(&body)
            .map_err(|e| RemdisError::LlmFailed(format!("request serialization failed: {e}")))?;

        let url = self.completions_url();
        let agent = self.agent.clone();
        let api_key = self.config.api_key.clone();
        let cancel = request.cancel.clone();
        let generation_id = request.generation_id;

        let gen_start = Instant::now();
        let http = tokio::task::spawn_blocking(move || -> std::result::Result<usize, String> {
            let mut req = agent.post(&url).set("Content-Type", "application/json");
            if !api_key.is_empty() {
                let auth = format!("Bearer {api_key}");
                req = req.set("Authorization", &auth);
            }

            let response = req
                .send_string(&body_str)
                .map_err(|e| format!("API request failed: {e}"))?;

            let reader = std::io::BufReader::new(response.into_reader());
            let mut tokens = 0usize;
            for line in std::io::BufRead::lines(reader) {
                if cancel.is_cancelled() {
                    break;
                }
                let line = line.map_err(|e| format!("stream read error: {e}"))?;
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break;
                }
                let chunk: serde_json::Value =
                    serde_json::from_str(data).map_err(|e| format!("SSE parse error: {e}"))?;
                if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str() {
                    if !content.is_empty() {
                        tokens += 1;
                        if tx.blocking_send(content.to_owned()).is_err() {
                            break;
                        }
                    }
                }
                if chunk["choices"][0]["finish_reason"].as_str() == Some("stop") {
                    break;
                }
            }
            Ok(tokens)
        });

        match http.await {
            Ok(Ok(tokens)) => {
                let elapsed = gen_start.elapsed().as_secs_f64();
                info!(generation_id, tokens, "generation finished in {elapsed:.1}s");
                Ok(())
            }
            Ok(Err(e)) => Err(RemdisError::LlmFailed(e)),
            Err(e) => Err(RemdisError::LlmFailed(format!("HTTP task panicked: {e}"))),
        }
    }
}
