//! # Textile
//!
//! Context transformation middleware for LLM completions.
//!
//! Before each completion call, a [`Pipeline`] of [`Transformer`]s reshapes
//! the conversation: decaying stale turns, pruning messages unrelated to the
//! query, narrowing the tool list. The caller gets back a transformed
//! [`ConversationSnapshot`] and [`TurnState`] to send to the model.
//!
//! ## Core Concepts
//!
//! - **[`Message`] / [`ConversationSnapshot`]**: the ordered conversation,
//!   with per-message prominence, namespaced metadata and optional embedding.
//! - **[`TurnState`]**: per-call data (user message, turn index, query
//!   embedding, tools).
//! - **[`Transformer`]**: object-safe step, `(snapshot, &state) -> result`.
//! - **[`Pipeline`]**: runs the steps in order. A step that fails at runtime
//!   is rolled back and skipped; at least one non-system message always
//!   survives the run.
//! - **[`Cache`]**: shared, concurrent memoization for embeddings.
//! - **[`hooks`]**: one [`ExecutionMetric`](hooks::ExecutionMetric) per step
//!   delivered to registered callbacks.
//! - **[`completion`] / [`streaming`]**: transform-then-call glue over a
//!   [`CompletionBackend`](backend::CompletionBackend).
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use textile::hooks::MetricsCollector;
//! use textile::transformers::{DecayTransformer, ThresholdFilter};
//! use textile::{ConversationSnapshot, Message, Pipeline, TurnState};
//!
//! let metrics = Arc::new(MetricsCollector::new());
//! let pipeline = Pipeline::builder()
//!     .transformer(DecayTransformer::new(4, 0.05, 2)?)
//!     .transformer(ThresholdFilter::new(0.2)?)
//!     .on_metric(metrics.clone())
//!     .build()?;
//!
//! let snapshot = ConversationSnapshot::from_messages(vec![
//!     Message::system("You are a concise assistant."),
//!     Message::user("What's a monad?").at_turn(0),
//!     Message::assistant("A monoid in the category of endofunctors.").at_turn(0),
//!     Message::user("And in plain words?").at_turn(12),
//! ])?;
//!
//! let out = pipeline.run(snapshot, TurnState::new("And in plain words?", 12))?;
//! assert_eq!(out.snapshot.len(), 2);
//! assert_eq!(metrics.metrics().len(), 2);
//! # Ok::<(), textile::PipelineError>(())
//! ```

pub mod backend;
pub mod cache;
pub mod completion;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod hooks;
pub mod message;
pub mod patterns;
pub mod pipeline;
mod rt;
pub mod similarity;
pub mod snapshot;
pub mod streaming;
pub mod transformer;
pub mod transformers;
pub mod turn_state;

pub use cache::{shared_cache, Cache, CacheKey, CacheValue, InMemoryCache};
pub use completion::{CompletionClient, CompletionClientBuilder};
pub use config::{PipelineSettings, TransformerSpec};
pub use error::{HookError, PipelineError, Result};
pub use hooks::{ExecutionMetric, MetricsCallback, MetricsCollector, MetricsHook, StepStatus};
pub use message::{Message, MessageMetadata, Role};
pub use pipeline::{Pipeline, PipelineBuilder, ReinstatePolicy, TraceStep};
pub use snapshot::ConversationSnapshot;
pub use streaming::{ChunkFilter, StreamingAdapter};
pub use transformer::{BoxFut, FnTransformer, Transformer, TransformerResult};
pub use turn_state::TurnState;
