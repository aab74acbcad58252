//! The transformer contract.
//!
//! Transformers are the pluggable steps of a [`Pipeline`](crate::Pipeline).
//! Each one receives the current [`ConversationSnapshot`] by value and the
//! [`TurnState`] by reference, and hands back a [`TransformerResult`].
//! Passing the snapshot by value means a step owns it for the duration of its
//! call and cannot keep it afterwards.

use crate::error::Result;
use crate::patterns::ResponsePattern;
use crate::snapshot::ConversationSnapshot;
use crate::turn_state::TurnState;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// A boxed, pinned, Send future -- the return type of [`Transformer::transform_async`].
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Output of one transformation step.
#[derive(Debug, Clone)]
pub struct TransformerResult {
    /// The (possibly mutated) snapshot.
    pub snapshot: ConversationSnapshot,
    /// The (possibly replaced) turn state.
    pub state: TurnState,
    metrics: HashMap<String, Value>,
}

impl TransformerResult {
    pub fn new(snapshot: ConversationSnapshot, state: TurnState) -> Self {
        Self {
            snapshot,
            state,
            metrics: HashMap::new(),
        }
    }

    /// Result that keeps the incoming state unchanged.
    pub fn unchanged_state(snapshot: ConversationSnapshot, state: &TurnState) -> Self {
        Self::new(snapshot, state.clone())
    }

    /// Attach an extra key/value to this step's execution metric.
    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(key.into(), value.into());
        self
    }

    /// Extra values reported for the execution metric.
    pub fn metrics(&self) -> &HashMap<String, Value> {
        &self.metrics
    }

    pub(crate) fn into_parts(self) -> (ConversationSnapshot, TurnState, HashMap<String, Value>) {
        (self.snapshot, self.state, self.metrics)
    }
}

/// Object-safe trait for transformation steps.
///
/// Implementations must provide [`transform`](Self::transform); everything
/// else has a default. Configuration lives in the implementor's own fields
/// and is validated in its constructor, which returns
/// [`PipelineError::InvalidConfig`](crate::PipelineError::InvalidConfig) for
/// bad parameters.
///
/// Contract for `transform`:
/// - do not remove every non-system message (the pipeline has a backstop, but
///   a well-behaved step limits itself);
/// - return a new [`TurnState`] instead of changing the one received;
/// - metadata and embeddings may be changed in place, messages may be added
///   or removed;
/// - report a runtime failure as
///   [`PipelineError::TransformFailed`](crate::PipelineError::TransformFailed).
///   Other errors abort the run.
pub trait Transformer: Send + Sync {
    /// Instance name (for logging and metrics).
    fn name(&self) -> &str;

    /// Cheap gate evaluated before `transform`. Must be side-effect free.
    fn should_apply(&self, _snapshot: &ConversationSnapshot, _state: &TurnState) -> bool {
        true
    }

    /// Apply the step.
    fn transform(
        &self,
        snapshot: ConversationSnapshot,
        state: &TurnState,
    ) -> Result<TransformerResult>;

    /// Async variant used by [`Pipeline::run_async`](crate::Pipeline::run_async).
    ///
    /// Defaults to the synchronous `transform`. Override when the step does
    /// I/O (embedding calls) that should suspend instead of block.
    fn transform_async<'a>(
        &'a self,
        snapshot: ConversationSnapshot,
        state: &'a TurnState,
    ) -> BoxFut<'a, Result<TransformerResult>> {
        Box::pin(async move { self.transform(snapshot, state) })
    }

    /// Rewrites to apply to the model's reply, given the final turn state.
    ///
    /// A step that puts placeholders into the conversation returns the
    /// patterns that map them back. See
    /// [`Pipeline::response_patterns`](crate::Pipeline::response_patterns).
    fn on_response(&self, _state: &TurnState) -> Vec<ResponsePattern> {
        Vec::new()
    }
}

/// A [`Transformer`] backed by a closure.
///
/// Handy for one-off steps and tests.
///
/// # Example
///
/// ```
/// use textile::transformer::{FnTransformer, TransformerResult};
///
/// let tag_all = FnTransformer::new("tag", |mut snapshot, state| {
///     for msg in snapshot.iter_mut() {
///         msg.metadata.set_raw("seen", serde_json::json!(true));
///     }
///     Ok(TransformerResult::unchanged_state(snapshot, state))
/// });
/// ```
pub struct FnTransformer<F> {
    name: String,
    f: F,
}

impl<F> FnTransformer<F>
where
    F: Fn(ConversationSnapshot, &TurnState) -> Result<TransformerResult> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Transformer for FnTransformer<F>
where
    F: Fn(ConversationSnapshot, &TurnState) -> Result<TransformerResult> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(
        &self,
        snapshot: ConversationSnapshot,
        state: &TurnState,
    ) -> Result<TransformerResult> {
        (self.f)(snapshot, state)
    }
}
