//! Completion backend trait and normalized request/response types.
//!
//! The [`CompletionBackend`] trait is the narrow "send conversation, get
//! response" boundary between the pipeline and an LLM provider. The pipeline
//! only needs role, content and order preserved; everything else about the
//! provider wire format lives in the implementation.
//!
//! ## Architecture
//!
//! ```text
//! ConversationSnapshot ──render()──► ChatRequest ──► CompletionBackend
//!                                                     │
//!                                         ┌───────────┴───────────┐
//!                                    MockBackend             OllamaBackend
//!                                    canned text             /api/chat
//!                                                            NDJSON streaming
//! ```

pub mod mock;
mod ndjson;
pub mod ollama;

pub use mock::MockBackend;
pub use ollama::OllamaBackend;

use crate::error::Result;
use crate::message::Role;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// A single message in the completion API's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author.
    pub role: Role,
    /// The message content.
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Sampling options forwarded to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Provider-specific options merged into the request verbatim.
    pub extra: Option<Value>,
}

/// A normalized completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /// Model identifier (e.g. `"llama3.2:3b"`).
    pub model: String,
    /// Conversation in order.
    pub messages: Vec<ChatMessage>,
    /// Tool descriptors; empty when no tools are offered.
    pub tools: Vec<Value>,
    /// Tool choice directive, passed through untouched.
    pub tool_choice: Option<Value>,
    pub options: CompletionOptions,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            tool_choice: None,
            options: CompletionOptions::default(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }
}

/// A normalized completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The generated text content.
    pub text: String,
    /// HTTP status code (for diagnostics/logging).
    pub status: u16,
    /// Tool calls requested by the model, in the provider's JSON shape.
    pub tool_calls: Vec<Value>,
    /// Provider-specific metadata (token counts, timing, model info).
    pub metadata: Option<Value>,
}

/// One piece of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    /// Text delta carried by this chunk (may be empty).
    pub delta: String,
    /// Set on the provider's final chunk.
    pub done: bool,
    /// Provider-specific metadata, usually only on the final chunk.
    pub metadata: Option<Value>,
}

impl StreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            done: false,
            metadata: None,
        }
    }
}

/// A lazy, finite, non-restartable sequence of chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Abstraction over completion providers.
///
/// Implementors own their transport (HTTP client, base URL, credentials).
/// This trait is object-safe and designed to be used as `Arc<dyn CompletionBackend>`.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Execute a non-streaming completion.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Open a streaming completion. Chunks are produced as they arrive.
    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Strip known provider path suffixes from a base URL so endpoints can be
/// appended without double-pathing.
///
/// `"http://localhost:11434/api"` becomes `"http://localhost:11434"`.
pub(crate) fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    // longest first
    for suffix in ["/api/chat", "/api/embed", "/api"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}

/// POST a JSON body and return the response, mapping non-2xx statuses to
/// [`PipelineError::HttpError`](crate::PipelineError::HttpError).
pub(crate) async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &Value,
) -> Result<reqwest::Response> {
    let resp = client.post(url).json(body).send().await.map_err(|e| {
        crate::PipelineError::Other(format!("Failed to connect to {}: {}", url, e))
    })?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(crate::PipelineError::HttpError {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp)
}
