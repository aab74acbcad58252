//! Backend for Ollama's native chat API.
//!
//! [`OllamaBackend`] translates a [`ChatRequest`] into Ollama's `/api/chat`
//! endpoint. Streaming uses NDJSON with one
//! `{"message": {"content": "token"}, "done": false}` object per line.

use super::ndjson::NdjsonDecoder;
use super::{
    normalize_base_url, post_json, ChatRequest, ChatResponse, ChunkStream, CompletionBackend,
    StreamChunk,
};
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

/// Default local Ollama address.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Backend for Ollama's `/api/chat` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: Client,
    base_url: String,
}

impl OllamaBackend {
    /// Create a backend with a 60 second request timeout.
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a backend sharing an existing HTTP client.
    pub fn with_client(client: Client, base_url: impl AsRef<str>) -> Self {
        Self {
            client,
            base_url: normalize_base_url(base_url.as_ref()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    /// Build the Ollama `options` object.
    fn build_options(request: &ChatRequest) -> Value {
        let mut opts = serde_json::Map::new();
        if let Some(t) = request.options.temperature {
            opts.insert("temperature".into(), json!(t));
        }
        if let Some(n) = request.options.max_tokens {
            opts.insert("num_predict".into(), json!(n));
        }
        if let Some(extra) = request.options.extra.as_ref().and_then(Value::as_object) {
            for (k, v) in extra {
                opts.insert(k.clone(), v.clone());
            }
        }
        Value::Object(opts)
    }

    /// Build the JSON body for `/api/chat`.
    fn build_body(request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": stream,
            "options": Self::build_options(request),
        });
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
        }
        body
    }

    /// Extract metadata fields from an Ollama response.
    fn extract_metadata(json_resp: &Value) -> Option<Value> {
        let meta: serde_json::Map<String, Value> = [
            "model",
            "total_duration",
            "eval_count",
            "eval_duration",
            "prompt_eval_count",
        ]
        .iter()
        .filter_map(|k| json_resp.get(*k).map(|v| (k.to_string(), v.clone())))
        .collect();
        if meta.is_empty() {
            None
        } else {
            Some(Value::Object(meta))
        }
    }

    fn parse_chunk(value: &Value) -> Result<StreamChunk> {
        if let Some(err) = value.get("error").and_then(Value::as_str) {
            return Err(PipelineError::Other(format!("ollama: {}", err)));
        }
        let done = value.get("done").and_then(Value::as_bool) == Some(true);
        Ok(StreamChunk {
            delta: message_content(value).to_string(),
            done,
            metadata: if done { Self::extract_metadata(value) } else { None },
        })
    }
}

fn message_content(value: &Value) -> &str {
    value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("")
}

struct DecodeState<S> {
    body: Pin<Box<S>>,
    decoder: NdjsonDecoder,
    pending: VecDeque<Result<StreamChunk>>,
    finished: bool,
}

/// Turn a raw NDJSON byte stream into a lazy chunk stream.
///
/// Bytes are pulled from `body` only when the consumer polls. A transport
/// error is yielded once and ends the stream.
fn decode_stream<S, B, E>(body: S) -> ChunkStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<PipelineError> + Send,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: NdjsonDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };
    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                if item.is_err() {
                    st.pending.clear();
                    st.finished = true;
                }
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    for value in st.decoder.decode(bytes.as_ref()) {
                        st.pending.push_back(OllamaBackend::parse_chunk(&value));
                    }
                }
                Some(Err(err)) => {
                    st.finished = true;
                    return Some((Err(err.into()), st));
                }
                None => {
                    st.finished = true;
                    if let Some(value) = st.decoder.flush() {
                        st.pending.push_back(OllamaBackend::parse_chunk(&value));
                    }
                }
            }
        }
    }))
}

#[async_trait]
impl CompletionBackend for OllamaBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let url = self.endpoint();
        let body = Self::build_body(request, false);
        tracing::debug!(model = %request.model, messages = request.messages.len(), "ollama chat");
        let resp = post_json(&self.client, &url, &body).await?;
        let status = resp.status().as_u16();
        let json_resp: Value = resp.json().await?;

        if let Some(err) = json_resp.get("error").and_then(Value::as_str) {
            return Err(PipelineError::Other(format!("ollama: {}", err)));
        }
        let tool_calls = json_resp
            .get("message")
            .and_then(|m| m.get("tool_calls"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(ChatResponse {
            text: message_content(&json_resp).to_string(),
            status,
            tool_calls,
            metadata: Self::extract_metadata(&json_resp),
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let url = self.endpoint();
        let body = Self::build_body(request, true);
        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            "ollama chat stream"
        );
        let resp = post_json(&self.client, &url, &body).await?;
        Ok(decode_stream(resp.bytes_stream()))
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}
