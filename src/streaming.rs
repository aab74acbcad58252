//! Streaming completions with a transformed context.
//!
//! [`StreamingAdapter`] runs the pipeline over the conversation, opens a
//! streaming completion with the result, and hands back the provider's
//! chunk stream. Chunks pass through untouched unless a [`ChunkFilter`] is
//! configured, in which case they are rewritten as they flow. Nothing is
//! buffered beyond what the filter itself holds back.

use crate::backend::{ChatRequest, ChunkStream, CompletionBackend, StreamChunk};
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::snapshot::ConversationSnapshot;
use crate::transformer::TransformerResult;
use crate::turn_state::TurnState;
use crate::PipelineError;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Incremental text rewriter for streamed output.
///
/// `transform_chunk` may hold text back and return less than it received
/// (even nothing); `flush` releases whatever is left once the stream ends.
pub trait ChunkFilter: Send {
    fn transform_chunk(&mut self, chunk: &str) -> String;
    fn flush(&mut self) -> String;
}

/// Builds a fresh filter for each stream.
pub type FilterFactory = Arc<dyn Fn() -> Box<dyn ChunkFilter> + Send + Sync>;

/// A chunk stream rewritten by a [`ChunkFilter`].
///
/// Empty intermediate chunks are swallowed. The filter is flushed when
/// upstream ends, when it reports `done`, or before an upstream error is
/// passed on; nothing is yielded after an error.
pub struct FilteredStream {
    inner: ChunkStream,
    filter: Box<dyn ChunkFilter>,
    pending_error: Option<PipelineError>,
    finished: bool,
}

impl FilteredStream {
    pub fn new(inner: ChunkStream, filter: Box<dyn ChunkFilter>) -> Self {
        Self {
            inner,
            filter,
            pending_error: None,
            finished: false,
        }
    }
}

impl Stream for FilteredStream {
    type Item = Result<StreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if let Some(err) = this.pending_error.take() {
            this.finished = true;
            return Poll::Ready(Some(Err(err)));
        }
        if this.finished {
            return Poll::Ready(None);
        }
        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    let mut delta = this.filter.transform_chunk(&chunk.delta);
                    if chunk.done {
                        delta.push_str(&this.filter.flush());
                        this.finished = true;
                        return Poll::Ready(Some(Ok(StreamChunk { delta, ..chunk })));
                    }
                    if !delta.is_empty() {
                        return Poll::Ready(Some(Ok(StreamChunk { delta, ..chunk })));
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    let rest = this.filter.flush();
                    if rest.is_empty() {
                        this.finished = true;
                        return Poll::Ready(Some(Err(err)));
                    }
                    this.pending_error = Some(err);
                    return Poll::Ready(Some(Ok(StreamChunk::text(rest))));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    let rest = this.filter.flush();
                    if rest.is_empty() {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Ok(StreamChunk {
                        delta: rest,
                        done: true,
                        metadata: None,
                    })));
                }
            }
        }
    }
}

/// The transformed context plus the live chunk stream.
pub struct StreamingResponse {
    /// Snapshot and turn state the request was built from.
    pub context: TransformerResult,
    pub chunks: ChunkStream,
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("messages", &self.context.snapshot.len())
            .finish_non_exhaustive()
    }
}

/// Pipeline-then-stream glue.
#[derive(Clone)]
pub struct StreamingAdapter {
    pipeline: Arc<Pipeline>,
    backend: Arc<dyn CompletionBackend>,
    filter: Option<FilterFactory>,
}

impl StreamingAdapter {
    pub fn new(pipeline: Arc<Pipeline>, backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            pipeline,
            backend,
            filter: None,
        }
    }

    /// Rewrite chunks with a filter built per stream by `factory`.
    pub fn with_filter<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ChunkFilter> + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(factory));
        self
    }

    pub(crate) fn with_filter_factory(mut self, factory: Option<FilterFactory>) -> Self {
        self.filter = factory;
        self
    }

    /// Transform the context, then open a streaming completion on `model`.
    ///
    /// Pipeline errors surface before any request is sent.
    pub async fn stream(
        &self,
        model: &str,
        snapshot: ConversationSnapshot,
        state: TurnState,
    ) -> Result<StreamingResponse> {
        let context = self.pipeline.run_async(snapshot, state).await?;
        let request = ChatRequest::new(model, context.snapshot.render())
            .with_tools(context.state.tools.clone());
        self.open(request, context).await
    }

    pub(crate) async fn open(
        &self,
        request: ChatRequest,
        context: TransformerResult,
    ) -> Result<StreamingResponse> {
        tracing::debug!(
            backend = self.backend.name(),
            messages = request.messages.len(),
            filtered = self.filter.is_some(),
            "opening completion stream"
        );
        let upstream = self.backend.stream(&request).await?;
        let chunks: ChunkStream = match &self.filter {
            Some(factory) => Box::pin(FilteredStream::new(upstream, factory())),
            None => upstream,
        };
        Ok(StreamingResponse { context, chunks })
    }
}

impl std::fmt::Debug for StreamingAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingAdapter")
            .field("pipeline", &self.pipeline)
            .field("backend", &self.backend.name())
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::message::Message;
    use crate::patterns::{PatternFilter, ResponsePattern};
    use crate::transformers::ThresholdFilter;
    use futures::{stream, StreamExt};

    struct Upper;

    impl ChunkFilter for Upper {
        fn transform_chunk(&mut self, chunk: &str) -> String {
            chunk.to_uppercase()
        }

        fn flush(&mut self) -> String {
            String::new()
        }
    }

    /// Holds everything until flush.
    struct HoldAll(String);

    impl ChunkFilter for HoldAll {
        fn transform_chunk(&mut self, chunk: &str) -> String {
            self.0.push_str(chunk);
            String::new()
        }

        fn flush(&mut self) -> String {
            std::mem::take(&mut self.0)
        }
    }

    fn conversation() -> ConversationSnapshot {
        ConversationSnapshot::from_messages(vec![
            Message::system("Be brief").with_id("sys"),
            Message::user("old").with_id("u0").with_prominence(0.1).unwrap(),
            Message::user("Say hi").with_id("u1").at_turn(1),
        ])
        .unwrap()
    }

    fn texts(items: &[Result<StreamChunk>]) -> Vec<String> {
        items.iter().map(|c| c.as_ref().unwrap().delta.clone()).collect()
    }

    #[tokio::test]
    async fn test_unfiltered_stream_passes_through() {
        let pipeline = Arc::new(
            Pipeline::builder()
                .transformer(ThresholdFilter::new(0.5).unwrap())
                .build()
                .unwrap(),
        );
        let backend = Arc::new(MockBackend::fixed("hi there"));
        let adapter = StreamingAdapter::new(pipeline, backend.clone());

        let resp = adapter.stream("m", conversation(), TurnState::new("Say hi", 1)).await.unwrap();
        assert_eq!(resp.context.snapshot.ids(), vec!["sys", "u1"]);
        let chunks: Vec<_> = resp.chunks.collect().await;
        assert_eq!(texts(&chunks), vec!["hi", " there", ""]);

        let sent = &backend.requests()[0];
        assert_eq!(sent.messages.len(), 2);
        assert_eq!(sent.messages[1].content, "Say hi");
    }

    #[tokio::test]
    async fn test_filter_rewrites_chunks() {
        let adapter = StreamingAdapter::new(
            Arc::new(Pipeline::builder().build().unwrap()),
            Arc::new(MockBackend::fixed("a b")),
        )
        .with_filter(|| Box::new(Upper));
        let resp = adapter.stream("m", conversation(), TurnState::new("Say hi", 1)).await.unwrap();
        let chunks: Vec<_> = resp.chunks.collect().await;
        assert_eq!(texts(&chunks), vec!["A", " B", ""]);
    }

    #[tokio::test]
    async fn test_pattern_filter_over_mock_stream() {
        let adapter = StreamingAdapter::new(
            Arc::new(Pipeline::builder().build().unwrap()),
            Arc::new(MockBackend::fixed("Hello <USER> how are you")),
        )
        .with_filter(|| {
            let pattern = ResponsePattern::literal("<USER>", "Ada").unwrap();
            Box::new(PatternFilter::new(vec![pattern]))
        });
        let resp = adapter.stream("m", conversation(), TurnState::new("Say hi", 1)).await.unwrap();
        let text: String = resp.chunks.map(|c| c.unwrap().delta).collect::<Vec<_>>().await.concat();
        assert_eq!(text, "Hello Ada how are you");
    }

    #[tokio::test]
    async fn test_flush_before_error() {
        let upstream: ChunkStream = Box::pin(stream::iter(vec![
            Ok(StreamChunk::text("kept")),
            Err(PipelineError::Other("connection reset".into())),
            Ok(StreamChunk::text("never")),
        ]));
        let out: Vec<_> = FilteredStream::new(upstream, Box::new(HoldAll(String::new())))
            .collect()
            .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().delta, "kept");
        assert!(out[1].is_err());
    }

    #[tokio::test]
    async fn test_flush_when_upstream_ends_without_done() {
        let upstream: ChunkStream = Box::pin(stream::iter(vec![
            Ok(StreamChunk::text("a")),
            Ok(StreamChunk::text("b")),
        ]));
        let out: Vec<_> = FilteredStream::new(upstream, Box::new(HoldAll(String::new())))
            .collect()
            .await;
        assert_eq!(out.len(), 1);
        let last = out[0].as_ref().unwrap();
        assert_eq!(last.delta, "ab");
        assert!(last.done);
    }

    #[tokio::test]
    async fn test_pipeline_error_surfaces_before_request() {
        let snapshot = ConversationSnapshot::from_messages(vec![Message::system("only")]).unwrap();
        let backend = Arc::new(MockBackend::fixed("x"));
        let adapter =
            StreamingAdapter::new(Arc::new(Pipeline::builder().build().unwrap()), backend.clone());
        let err = adapter.stream("m", snapshot, TurnState::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvariantViolation(_)));
        assert!(backend.requests().is_empty());
    }
}
