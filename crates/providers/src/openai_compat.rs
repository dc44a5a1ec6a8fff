//! OpenAI-compatible embedding and generation collaborators.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Together AI, and any
//! endpoint exposing `/v1/embeddings` and `/v1/chat/completions`.
//!
//! Supports:
//! - Embeddings (`/embeddings`, float encoding)
//! - Streaming chat completions over SSE, surfaced as a fragment stream

use async_trait::async_trait;
use canopy_core::embedding::Embedder;
use canopy_core::error::{EmbeddingError, GenerationError};
use canopy_core::generation::{FragmentStream, GenerationRequest, Generator};
use canopy_core::message::Role;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// System instructions sent ahead of every assembled context.
const SYSTEM_PROMPT: &str = "You are continuing one branch of a tree of conversations. \
Earlier messages are inherited from parent conversations. Messages prefixed with \
[Recalled from ...] were retrieved from elsewhere in the forest; use them when relevant.";

/// Shared HTTP plumbing for one OpenAI-compatible endpoint.
#[derive(Clone)]
struct ApiClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ApiClient {
    fn new(base_url: &str, api_key: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        }
    }

    /// POST a JSON body and map non-success statuses to errors.
    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
        streaming: bool,
    ) -> Result<reqwest::Response, GenerationError> {
        let url = format!("{}/{path}", self.base_url);
        let mut request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if streaming {
            request = request.header("Accept", "text/event-stream");
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| GenerationError::Network(e.to_string()))?;

        let status = response.status().as_u16();

        if status == 429 {
            return Err(GenerationError::RateLimited {
                retry_after_secs: 5,
            });
        }

        if status == 401 || status == 403 {
            return Err(GenerationError::Api {
                status_code: status,
                message: "Invalid API key or insufficient permissions".into(),
            });
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, path, "Endpoint returned error");
            return Err(GenerationError::Api {
                status_code: status,
                message: error_body,
            });
        }

        Ok(response)
    }
}

/// Embeddings from an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiCompatEmbedder {
    api: ApiClient,
    model: String,
    dimensions: usize,
}

impl OpenAiCompatEmbedder {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            api: ApiClient::new(base_url, api_key),
            model: model.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiCompatEmbedder {
    fn name(&self) -> &str {
        "openai_compat"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
            "encoding_format": "float",
            "dimensions": self.dimensions,
        });

        debug!(model = %self.model, chars = text.len(), "Sending embedding request");

        let response = self
            .api
            .post("embeddings", &body, false)
            .await
            .map_err(|e| EmbeddingError::Backend(e.to_string()))?;

        let api_resp: EmbeddingApiResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Backend(format!("Failed to parse embedding response: {e}")))?;

        api_resp
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::Backend("No embedding in response".into()))
    }
}

/// Streaming chat completions from an OpenAI-compatible endpoint.
pub struct OpenAiCompatGenerator {
    api: ApiClient,
    model: String,
    temperature: f32,
}

impl OpenAiCompatGenerator {
    pub fn new(base_url: &str, api_key: &str, model: impl Into<String>, temperature: f32) -> Self {
        Self {
            api: ApiClient::new(base_url, api_key),
            model: model.into(),
            temperature,
        }
    }

    /// System prompt, then the assembled context in order, then the new turn.
    fn to_api_messages(request: &GenerationRequest) -> Vec<ApiMessage> {
        let mut messages = Vec::with_capacity(request.context.len() + 2);
        messages.push(ApiMessage {
            role: Role::System.as_str().into(),
            content: SYSTEM_PROMPT.into(),
        });
        messages.extend(request.context.iter().map(|m| ApiMessage {
            role: m.role.as_str().into(),
            content: m.render(),
        }));
        messages.push(ApiMessage {
            role: Role::User.as_str().into(),
            content: request.user_turn.clone(),
        });
        messages
    }
}

#[async_trait]
impl Generator for OpenAiCompatGenerator {
    fn name(&self) -> &str {
        "openai_compat"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<FragmentStream, GenerationError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": Self::to_api_messages(&request),
            "temperature": self.temperature,
            "stream": true,
        });

        debug!(
            model = %self.model,
            node_id = %request.node_id,
            context = request.context.len(),
            "Sending streaming request"
        );

        let response = self.api.post("chat/completions", &body, true).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);

        // Spawn task to read the SSE byte stream and forward content deltas
        tokio::spawn(forward_sse(response.bytes_stream(), tx));

        Ok(rx)
    }
}

/// Forward content deltas from an SSE byte stream into `tx`.
///
/// A stream that ends without `[DONE]` is reported as interrupted, so the
/// partial reply is never taken for a complete one.
async fn forward_sse<S, B, E>(stream: S, tx: tokio::sync::mpsc::Sender<Result<String, GenerationError>>)
where
    S: futures::Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut buffer = String::new();

    while let Some(chunk_result) = stream.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(Err(GenerationError::StreamInterrupted(e.to_string())))
                    .await;
                return;
            }
        };

        buffer.push_str(&String::from_utf8_lossy(bytes.as_ref()));

        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim_end_matches('\r').to_string();
            buffer = buffer[line_end + 1..].to_string();

            match parse_sse_line(&line) {
                SseEvent::Fragment(text) => {
                    if tx.send(Ok(text)).await.is_err() {
                        return; // receiver dropped
                    }
                }
                SseEvent::Done => return,
                SseEvent::Skip => {}
            }
        }
    }

    warn!("SSE stream closed before [DONE]");
    let _ = tx
        .send(Err(GenerationError::StreamInterrupted(
            "stream closed before [DONE]".into(),
        )))
        .await;
}

/// What one SSE line contributes to the reply.
#[derive(Debug, PartialEq)]
enum SseEvent {
    Fragment(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseEvent {
    // Skip empty lines and SSE comments
    if line.is_empty() || line.starts_with(':') {
        return SseEvent::Skip;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseEvent::Done;
    }

    match serde_json::from_str::<StreamResponse>(data) {
        Ok(resp) => resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty())
            .map_or(SseEvent::Skip, SseEvent::Fragment),
        Err(e) => {
            trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
            SseEvent::Skip
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
