//! Mock backend for testing without a live LLM.
//!
//! [`MockBackend`] returns pre-configured responses in order and records
//! every request it receives, so tests can assert on what the pipeline
//! actually forwarded.
//!
//! # Example
//!
//! ```
//! use textile::backend::MockBackend;
//!
//! let mock = MockBackend::new(vec!["Hello, world!".to_string()]);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use super::{ChatRequest, ChatResponse, ChunkStream, CompletionBackend, StreamChunk};
use crate::error::Result;
use crate::PipelineError;

/// A test backend that returns canned responses in order.
///
/// Cycles back to the beginning when all responses have been consumed.
/// Streaming splits the response into word-sized chunks (whitespace kept
/// attached to the following word) and ends with an empty `done` chunk.
#[derive(Debug)]
pub struct MockBackend {
    responses: Vec<String>,
    index: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
    fail_stream_after: Option<usize>,
}

impl MockBackend {
    /// Create a mock backend with the given canned responses.
    ///
    /// An empty list behaves like a single empty response.
    pub fn new(responses: Vec<String>) -> Self {
        let responses = if responses.is_empty() {
            vec![String::new()]
        } else {
            responses
        };
        Self {
            responses,
            index: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            fail_stream_after: None,
        }
    }

    /// Create a mock that always returns the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Make streams yield an error after `chunks` chunks.
    pub fn failing_stream_after(mut self, chunks: usize) -> Self {
        self.fail_stream_after = Some(chunks);
        self
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    fn record(&self, request: &ChatRequest) {
        match self.requests.lock() {
            Ok(mut r) => r.push(request.clone()),
            Err(p) => p.into_inner().push(request.clone()),
        }
    }

    fn next_response(&self) -> String {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.responses.len();
        self.responses[idx].clone()
    }
}

/// Split text into chunks that start at word boundaries.
fn word_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_whitespace() && !current.trim().is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.record(request);
        Ok(ChatResponse {
            text: self.next_response(),
            status: 200,
            tool_calls: Vec::new(),
            metadata: None,
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        self.record(request);
        let mut items: Vec<Result<StreamChunk>> = word_chunks(&self.next_response())
            .into_iter()
            .map(|c| Ok(StreamChunk::text(c)))
            .collect();
        if let Some(limit) = self.fail_stream_after {
            items.truncate(limit);
            items.push(Err(PipelineError::Other("mock stream interrupted".into())));
        } else {
            items.push(Ok(StreamChunk {
                delta: String::new(),
                done: true,
                metadata: None,
            }));
        }
        Ok(Box::pin(stream::iter(items)))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChatMessage;
    use crate::message::Role;
    use futures::StreamExt;

    fn request() -> ChatRequest {
        ChatRequest::new("test", vec![ChatMessage::new(Role::User, "hi")])
    }

    #[tokio::test]
    async fn test_mock_fixed_response() {
        let mock = MockBackend::fixed("Hello!");
        let resp = mock.complete(&request()).await.unwrap();
        assert_eq!(resp.text, "Hello!");
        assert_eq!(resp.status, 200);
        assert_eq!(mock.requests().len(), 1);
    }

    #[test]
    fn test_mock_blocking_call() {
        let mock = MockBackend::fixed("sync");
        let resp = tokio_test::block_on(mock.complete(&request())).unwrap();
        assert_eq!(resp.text, "sync");
    }

    #[tokio::test]
    async fn test_mock_cycles_responses() {
        let mock = MockBackend::new(vec!["first".into(), "second".into()]);
        let r1 = mock.complete(&request()).await.unwrap();
        let r2 = mock.complete(&request()).await.unwrap();
        let r3 = mock.complete(&request()).await.unwrap();
        assert_eq!(r1.text, "first");
        assert_eq!(r2.text, "second");
        assert_eq!(r3.text, "first"); // cycles
    }

    #[tokio::test]
    async fn test_mock_streaming_word_chunks() {
        let mock = MockBackend::fixed("Hello big world");
        let chunks: Vec<_> = mock.stream(&request()).await.unwrap().collect().await;
        let deltas: Vec<_> = chunks.iter().map(|c| c.as_ref().unwrap().delta.clone()).collect();
        assert_eq!(deltas, vec!["Hello", " big", " world", ""]);
        assert!(chunks.last().unwrap().as_ref().unwrap().done);
    }

    #[tokio::test]
    async fn test_mock_stream_failure() {
        let mock = MockBackend::fixed("a b c").failing_stream_after(1);
        let chunks: Vec<_> = mock.stream(&request()).await.unwrap().collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_ok());
        assert!(chunks[1].is_err());
    }
}
