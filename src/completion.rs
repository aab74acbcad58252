//! High-level completion client.
//!
//! [`CompletionClient`] takes raw chat messages the way a completion API
//! receives them, runs the pipeline over them, calls the backend with the
//! transformed conversation and returns the (optionally rewritten) response.
//!
//! ```text
//! Vec<ChatMessage> ──prepare_context──► Pipeline::run_async ──render──► backend
//!                                                                        │
//!                              response patterns ◄───────────────────────┘
//! ```
//!
//! With no transformers and no patterns the client is a passthrough: the
//! request reaches the backend exactly as given.

use crate::backend::{ChatMessage, ChatRequest, ChatResponse, CompletionBackend, CompletionOptions};
use crate::error::Result;
use crate::message::Message;
use crate::patterns::{apply_patterns, PatternFilter, ResponsePattern};
use crate::pipeline::Pipeline;
use crate::snapshot::ConversationSnapshot;
use crate::streaming::{ChunkFilter, FilterFactory, StreamingAdapter, StreamingResponse};
use crate::transformer::TransformerResult;
use crate::turn_state::TurnState;
use crate::PipelineError;
use serde_json::Value;
use std::sync::Arc;

/// Transform-then-complete client.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use textile::backend::{ChatMessage, OllamaBackend};
/// use textile::completion::CompletionClient;
/// use textile::transformers::DecayTransformer;
/// use textile::{Pipeline, Role};
///
/// # async fn demo() -> textile::Result<()> {
/// let backend = Arc::new(OllamaBackend::new("http://localhost:11434")?);
/// let client = CompletionClient::builder(backend, "llama3.2")
///     .pipeline(Pipeline::builder().transformer(DecayTransformer::new(5, 0.1, 4)?).build()?)
///     .build();
/// let resp = client
///     .complete(vec![ChatMessage::new(Role::User, "Hello")], Vec::new())
///     .await?;
/// println!("{}", resp.text);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CompletionClient {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    pipeline: Arc<Pipeline>,
    patterns: Vec<ResponsePattern>,
    options: CompletionOptions,
    max_tokens: Option<usize>,
}

impl std::fmt::Debug for CompletionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionClient")
            .field("backend", &self.backend.name())
            .field("model", &self.model)
            .field("pipeline", &self.pipeline)
            .field("patterns", &self.patterns)
            .finish()
    }
}

impl CompletionClient {
    pub fn builder(
        backend: Arc<dyn CompletionBackend>,
        model: impl Into<String>,
    ) -> CompletionClientBuilder {
        CompletionClientBuilder {
            backend,
            model: model.into(),
            pipeline: None,
            patterns: Vec::new(),
            options: CompletionOptions::default(),
            max_tokens: None,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    fn is_passthrough(&self) -> bool {
        self.pipeline.is_empty() && self.patterns.is_empty()
    }

    /// Build the snapshot and turn state for raw chat messages.
    ///
    /// Each message's turn index is its position; the current turn is the
    /// last index and the user message is the last message's content.
    pub fn prepare_context(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<Value>,
    ) -> Result<(ConversationSnapshot, TurnState)> {
        ensure_not_empty(&messages)?;
        let last_turn = (messages.len() - 1) as u64;
        let user_message = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let state = TurnState::new(user_message, last_turn).with_tools(tools);
        let converted = messages
            .into_iter()
            .enumerate()
            .map(|(i, chat)| Message::from_chat(chat).at_turn(i as u64))
            .collect();
        let mut snapshot = ConversationSnapshot::from_messages(converted)?;
        if let Some(limit) = self.max_tokens {
            snapshot = snapshot.with_max_tokens(limit);
        }
        Ok((snapshot, state))
    }

    /// Prepare and transform the context without calling the backend.
    pub async fn transform(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<Value>,
    ) -> Result<TransformerResult> {
        let (snapshot, state) = self.prepare_context(messages, tools)?;
        self.pipeline.run_async(snapshot, state).await
    }

    /// Patterns for the reply: those the transformers register for the
    /// final state (last step first), then the client's own.
    pub fn response_patterns(&self, state: &TurnState) -> Vec<ResponsePattern> {
        let mut patterns = self.pipeline.response_patterns(state);
        patterns.extend(self.patterns.iter().cloned());
        patterns
    }

    fn request(&self, messages: Vec<ChatMessage>, tools: Vec<Value>) -> ChatRequest {
        ChatRequest::new(self.model.clone(), messages)
            .with_tools(tools)
            .with_options(self.options.clone())
    }

    /// Transform the conversation, complete it and apply response patterns.
    pub async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<Value>,
    ) -> Result<ChatResponse> {
        if self.is_passthrough() {
            ensure_not_empty(&messages)?;
            return self.backend.complete(&self.request(messages, tools)).await;
        }
        let context = self.transform(messages, tools).await?;
        let patterns = self.response_patterns(&context.state);
        let request = self.request(context.snapshot.render(), context.state.tools);
        let mut response = self.backend.complete(&request).await?;
        if !patterns.is_empty() && !response.text.is_empty() {
            let (text, replaced) = apply_patterns(&patterns, &response.text);
            tracing::debug!(replaced, patterns = patterns.len(), "applied response patterns");
            response.text = text;
        }
        Ok(response)
    }

    /// Transform the conversation and open a streaming completion.
    ///
    /// Response patterns are applied chunk by chunk.
    pub async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<Value>,
    ) -> Result<StreamingResponse> {
        let (request, context) = if self.is_passthrough() {
            let (snapshot, state) = self.prepare_context(messages.clone(), tools.clone())?;
            (
                self.request(messages, tools),
                TransformerResult::new(snapshot, state),
            )
        } else {
            let context = self.transform(messages, tools).await?;
            let request = self.request(context.snapshot.render(), context.state.tools.clone());
            (request, context)
        };
        let patterns = self.response_patterns(&context.state);
        StreamingAdapter::new(Arc::clone(&self.pipeline), Arc::clone(&self.backend))
            .with_filter_factory(filter_factory(patterns))
            .open(request, context)
            .await
    }
}

fn ensure_not_empty(messages: &[ChatMessage]) -> Result<()> {
    if messages.is_empty() {
        return Err(PipelineError::InvariantViolation(
            "conversation has no messages".to_string(),
        ));
    }
    Ok(())
}

fn filter_factory(patterns: Vec<ResponsePattern>) -> Option<FilterFactory> {
    if patterns.is_empty() {
        return None;
    }
    Some(Arc::new(move || {
        Box::new(PatternFilter::new(patterns.clone())) as Box<dyn ChunkFilter>
    }))
}

/// Builder for [`CompletionClient`].
pub struct CompletionClientBuilder {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    pipeline: Option<Arc<Pipeline>>,
    patterns: Vec<ResponsePattern>,
    options: CompletionOptions,
    max_tokens: Option<usize>,
}

impl CompletionClientBuilder {
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(Arc::new(pipeline));
        self
    }

    /// Share a pipeline with other clients.
    pub fn shared_pipeline(mut self, pipeline: Arc<Pipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn pattern(mut self, pattern: ResponsePattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    /// Token budget recorded on every prepared snapshot.
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn build(self) -> CompletionClient {
        CompletionClient {
            backend: self.backend,
            model: self.model,
            pipeline: self
                .pipeline
                .unwrap_or_else(|| Arc::new(Pipeline::new(Vec::new()))),
            patterns: self.patterns,
            options: self.options,
            max_tokens: self.max_tokens,
        }
    }
}
