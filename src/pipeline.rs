//! Pipeline orchestrator.
//!
//! [`Pipeline`] runs an ordered list of transformers against a conversation
//! snapshot. Per step it evaluates `should_apply`, runs `transform`, reports
//! an [`ExecutionMetric`], and adopts the output. A step failing with a
//! recoverable error (see [`PipelineError::is_recoverable`]) is logged and
//! its effect discarded; any other error aborts the run.
//!
//! After the last step the backstop runs: if no non-system message is left,
//! one message removed during this run is put back according to the
//! configured [`ReinstatePolicy`].

use crate::{
    backend::ChatMessage,
    cache::Cache,
    error::Result,
    hooks::{ExecutionMetric, MetricsCallback, MetricsHook, StepStatus},
    message::Message,
    patterns::ResponsePattern,
    snapshot::ConversationSnapshot,
    transformer::{Transformer, TransformerResult},
    turn_state::TurnState,
    PipelineError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Which removed message the backstop reinstates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReinstatePolicy {
    /// Highest prominence, then earliest turn index, then earliest position.
    #[default]
    HighestProminence,
    /// Latest turn index, then latest position.
    MostRecent,
}

/// One entry of a debug trace produced by [`Pipeline::run_traced`].
#[derive(Debug, Clone, Serialize)]
pub struct TraceStep {
    /// 0 for the initial snapshot, then 1-based step number.
    pub step: usize,
    /// `None` for the initial entry.
    pub transformer: Option<String>,
    pub status: Option<StepStatus>,
    pub messages_before: usize,
    pub messages_after: usize,
    pub messages_removed: usize,
    /// The snapshot after this step, rendered.
    pub messages: Vec<ChatMessage>,
}

struct Removed {
    message: Message,
    position: usize,
}

/// Per-run bookkeeping: original positions, removed messages, optional trace.
struct RunTracker {
    positions: HashMap<String, usize>,
    removed: Vec<Removed>,
    trace: Option<Vec<TraceStep>>,
}

impl RunTracker {
    fn new(snapshot: &ConversationSnapshot, traced: bool) -> Self {
        let positions = snapshot
            .messages()
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id().to_string(), i))
            .collect();
        let trace = traced.then(|| {
            vec![TraceStep {
                step: 0,
                transformer: None,
                status: None,
                messages_before: snapshot.len(),
                messages_after: snapshot.len(),
                messages_removed: 0,
                messages: snapshot.render(),
            }]
        });
        Self {
            positions,
            removed: Vec::new(),
            trace,
        }
    }

    fn position(&self, id: &str) -> usize {
        self.positions.get(id).copied().unwrap_or(usize::MAX)
    }

    /// Record what a step removed and register messages it added.
    fn note_step(&mut self, before: &ConversationSnapshot, after: &ConversationSnapshot) -> usize {
        let kept: HashSet<&str> = after.messages().iter().map(Message::id).collect();
        let mut removed = 0;
        for msg in before.messages() {
            if !kept.contains(msg.id()) {
                removed += 1;
                self.removed.push(Removed {
                    message: msg.clone(),
                    position: self.position(msg.id()),
                });
            }
        }
        for msg in after.messages() {
            let next = self.positions.len();
            self.positions.entry(msg.id().to_string()).or_insert(next);
        }
        removed
    }

    fn trace_step(
        &mut self,
        step: usize,
        name: &str,
        status: StepStatus,
        messages_before: usize,
        current: &ConversationSnapshot,
        messages_removed: usize,
    ) {
        if let Some(trace) = self.trace.as_mut() {
            trace.push(TraceStep {
                step,
                transformer: Some(name.to_string()),
                status: Some(status),
                messages_before,
                messages_after: current.len(),
                messages_removed,
                messages: current.render(),
            });
        }
    }

    /// Take the best removed non-system message that is not in `snapshot`.
    fn take_best(
        &mut self,
        policy: ReinstatePolicy,
        snapshot: &ConversationSnapshot,
    ) -> Option<Removed> {
        let best = self
            .removed
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.message.is_system() && !snapshot.contains(r.message.id()))
            .min_by(|(_, a), (_, b)| match policy {
                ReinstatePolicy::HighestProminence => b
                    .message
                    .metadata
                    .prominence()
                    .total_cmp(&a.message.metadata.prominence())
                    .then(a.message.turn_index().cmp(&b.message.turn_index()))
                    .then(a.position.cmp(&b.position)),
                ReinstatePolicy::MostRecent => b
                    .message
                    .turn_index()
                    .cmp(&a.message.turn_index())
                    .then(b.position.cmp(&a.position)),
            })
            .map(|(idx, _)| idx)?;
        Some(self.removed.swap_remove(best))
    }
}

/// Ordered chain of transformers plus the hooks and policies that govern a run.
///
/// Configuration is fixed at construction; a `Pipeline` is `Send + Sync` and
/// can be shared (`Arc<Pipeline>`) by concurrent runs, each of which owns its
/// own snapshot and turn state.
///
/// # Example
///
/// ```
/// use textile::{ConversationSnapshot, Message, Pipeline, TurnState};
/// use textile::transformers::DecayTransformer;
///
/// let pipeline = Pipeline::builder()
///     .transformer(DecayTransformer::new(5, 0.1, 4)?)
///     .build()?;
///
/// let snapshot = ConversationSnapshot::from_messages(vec![
///     Message::system("You are helpful"),
///     Message::user("Hi").at_turn(0),
/// ])?;
/// let out = pipeline.run(snapshot, TurnState::new("Hi", 0))?;
/// assert_eq!(out.snapshot.len(), 2);
/// # Ok::<(), textile::PipelineError>(())
/// ```
pub struct Pipeline {
    transformers: Vec<Arc<dyn Transformer>>,
    hooks: MetricsHook,
    reinstate: ReinstatePolicy,
    step_timeout: Option<Duration>,
    cache: Option<Arc<dyn Cache>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("transformers", &self.transformer_names())
            .field("hooks", &self.hooks.len())
            .field("reinstate", &self.reinstate)
            .field("step_timeout", &self.step_timeout)
            .field("has_cache", &self.cache.is_some())
            .finish()
    }
}

impl Pipeline {
    /// Create a new pipeline builder.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Pipeline with the given transformers and default settings.
    pub fn new(transformers: Vec<Arc<dyn Transformer>>) -> Self {
        Self {
            transformers,
            hooks: MetricsHook::new(),
            reinstate: ReinstatePolicy::default(),
            step_timeout: None,
            cache: None,
        }
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    pub fn transformer_names(&self) -> Vec<&str> {
        self.transformers.iter().map(|t| t.name()).collect()
    }

    pub fn reinstate_policy(&self) -> ReinstatePolicy {
        self.reinstate
    }

    /// Response patterns every transformer registers for `state`.
    ///
    /// The last transformer's patterns come first, so placeholders are
    /// unwound in the reverse of the order they were introduced.
    pub fn response_patterns(&self, state: &TurnState) -> Vec<ResponsePattern> {
        self.transformers
            .iter()
            .rev()
            .flat_map(|t| t.on_response(state))
            .collect()
    }

    /// Cache configured alongside this pipeline, if any.
    pub fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.cache.as_ref()
    }

    /// Run every transformer synchronously.
    ///
    /// Steps run through [`Transformer::transform`]. The step timeout is not
    /// applied here; use [`run_async`](Self::run_async) for bounded steps.
    pub fn run(
        &self,
        snapshot: ConversationSnapshot,
        state: TurnState,
    ) -> Result<TransformerResult> {
        self.run_sync_inner(snapshot, state, false).map(|(result, _)| result)
    }

    /// Like [`run`](Self::run), also returning a per-step debug trace.
    pub fn run_traced(
        &self,
        snapshot: ConversationSnapshot,
        state: TurnState,
    ) -> Result<(TransformerResult, Vec<TraceStep>)> {
        self.run_sync_inner(snapshot, state, true)
    }

    /// Run every transformer, awaiting [`Transformer::transform_async`].
    ///
    /// Same ordering and failure semantics as [`run`](Self::run). When a step
    /// timeout is configured, an expired step counts as a recoverable failure.
    pub async fn run_async(
        &self,
        snapshot: ConversationSnapshot,
        state: TurnState,
    ) -> Result<TransformerResult> {
        self.run_async_inner(snapshot, state, false)
            .await
            .map(|(result, _)| result)
    }

    /// Like [`run_async`](Self::run_async), also returning a per-step debug trace.
    pub async fn run_async_traced(
        &self,
        snapshot: ConversationSnapshot,
        state: TurnState,
    ) -> Result<(TransformerResult, Vec<TraceStep>)> {
        self.run_async_inner(snapshot, state, true).await
    }

    fn run_sync_inner(
        &self,
        mut snapshot: ConversationSnapshot,
        mut state: TurnState,
        traced: bool,
    ) -> Result<(TransformerResult, Vec<TraceStep>)> {
        let span = tracing::debug_span!(
            "pipeline_run",
            transformers = self.len(),
            messages = snapshot.len()
        );
        let _entered = span.enter();
        let mut tracker = RunTracker::new(&snapshot, traced);

        for (idx, transformer) in self.transformers.iter().enumerate() {
            let transformer = transformer.as_ref();
            if !transformer.should_apply(&snapshot, &state) {
                self.record_skip(idx, transformer.name(), &snapshot, &mut tracker);
                continue;
            }
            let before = snapshot.clone();
            let started = Instant::now();
            let outcome = transformer.transform(snapshot, &state);
            (snapshot, state) = self.settle(
                idx,
                transformer.name(),
                before,
                state,
                outcome,
                started.elapsed(),
                &mut tracker,
            )?;
        }

        self.finish(snapshot, state, tracker)
    }

    async fn run_async_inner(
        &self,
        mut snapshot: ConversationSnapshot,
        mut state: TurnState,
        traced: bool,
    ) -> Result<(TransformerResult, Vec<TraceStep>)> {
        let span = tracing::debug_span!(
            "pipeline_run",
            transformers = self.len(),
            messages = snapshot.len()
        );
        async move {
            let mut tracker = RunTracker::new(&snapshot, traced);

            for (idx, transformer) in self.transformers.iter().enumerate() {
                let transformer = transformer.as_ref();
                if !transformer.should_apply(&snapshot, &state) {
                    self.record_skip(idx, transformer.name(), &snapshot, &mut tracker);
                    continue;
                }
                let before = snapshot.clone();
                let started = Instant::now();
                let fut = transformer.transform_async(snapshot, &state);
                let outcome = match self.step_timeout {
                    Some(limit) => match tokio::time::timeout(limit, fut).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(PipelineError::StepTimeout {
                            transformer: transformer.name().to_string(),
                            timeout: limit,
                        }),
                    },
                    None => fut.await,
                };
                (snapshot, state) = self.settle(
                    idx,
                    transformer.name(),
                    before,
                    state,
                    outcome,
                    started.elapsed(),
                    &mut tracker,
                )?;
            }

            self.finish(snapshot, state, tracker)
        }
        .instrument(span)
        .await
    }

    fn record_skip(
        &self,
        idx: usize,
        name: &str,
        snapshot: &ConversationSnapshot,
        tracker: &mut RunTracker,
    ) {
        tracing::debug!(transformer = name, step = idx, "should_apply returned false; skipping");
        self.emit(ExecutionMetric {
            transformer_name: name.to_string(),
            step_index: idx,
            status: StepStatus::Skipped,
            duration: Duration::ZERO,
            messages_before: snapshot.len(),
            messages_after: snapshot.len(),
            messages_removed: 0,
            error: None,
            extra: HashMap::new(),
        });
        tracker.trace_step(idx + 1, name, StepStatus::Skipped, snapshot.len(), snapshot, 0);
    }

    /// Adopt a step's output, or roll back to `before` on a recoverable failure.
    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        idx: usize,
        name: &str,
        before: ConversationSnapshot,
        state: TurnState,
        outcome: Result<TransformerResult>,
        elapsed: Duration,
        tracker: &mut RunTracker,
    ) -> Result<(ConversationSnapshot, TurnState)> {
        let messages_before = before.len();
        match outcome {
            Ok(result) => {
                let (snapshot, next_state, extra) = result.into_parts();
                let removed = tracker.note_step(&before, &snapshot);
                tracing::debug!(
                    transformer = name,
                    step = idx,
                    messages_before,
                    messages_after = snapshot.len(),
                    removed,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    "transformer applied"
                );
                self.emit(ExecutionMetric {
                    transformer_name: name.to_string(),
                    step_index: idx,
                    status: StepStatus::Applied,
                    duration: elapsed,
                    messages_before,
                    messages_after: snapshot.len(),
                    messages_removed: removed,
                    error: None,
                    extra,
                });
                tracker.trace_step(
                    idx + 1,
                    name,
                    StepStatus::Applied,
                    messages_before,
                    &snapshot,
                    removed,
                );
                Ok((snapshot, next_state))
            }
            Err(err) => {
                self.emit(ExecutionMetric {
                    transformer_name: name.to_string(),
                    step_index: idx,
                    status: StepStatus::Failed,
                    duration: elapsed,
                    messages_before,
                    messages_after: messages_before,
                    messages_removed: 0,
                    error: Some(err.to_string()),
                    extra: HashMap::<String, Value>::new(),
                });
                if !err.is_recoverable() {
                    tracing::error!(
                        transformer = name,
                        step = idx,
                        error = %err,
                        "transformer failed; aborting run"
                    );
                    return Err(err);
                }
                tracing::warn!(
                    transformer = name,
                    step = idx,
                    error = %err,
                    "transformer failed; keeping previous snapshot"
                );
                tracker.trace_step(idx + 1, name, StepStatus::Failed, messages_before, &before, 0);
                Ok((before, state))
            }
        }
    }

    fn emit(&self, metric: ExecutionMetric) {
        if !self.hooks.is_empty() {
            self.hooks.dispatch(&metric);
        }
    }

    /// Backstop: guarantee at least one non-system message survives.
    fn finish(
        &self,
        mut snapshot: ConversationSnapshot,
        state: TurnState,
        mut tracker: RunTracker,
    ) -> Result<(TransformerResult, Vec<TraceStep>)> {
        if snapshot.non_system_count() == 0 {
            let best = tracker.take_best(self.reinstate, &snapshot).ok_or_else(|| {
                PipelineError::InvariantViolation(
                    "conversation has no non-system message to keep".to_string(),
                )
            })?;
            let insert_at = snapshot
                .messages()
                .iter()
                .take_while(|m| tracker.position(m.id()) < best.position)
                .count();
            tracing::warn!(
                message_id = best.message.id(),
                turn_index = best.message.turn_index(),
                prominence = best.message.metadata.prominence(),
                "all non-system messages were removed; reinstating one"
            );
            snapshot.insert(insert_at, best.message)?;
        }
        let trace = tracker.trace.take().unwrap_or_default();
        Ok((TransformerResult::new(snapshot, state), trace))
    }
}

/// Builder for [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    transformers: Vec<Arc<dyn Transformer>>,
    hooks: MetricsHook,
    reinstate: ReinstatePolicy,
    step_timeout: Option<Duration>,
    cache: Option<Arc<dyn Cache>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transformer to the end of the chain.
    pub fn transformer(mut self, transformer: impl Transformer + 'static) -> Self {
        self.transformers.push(Arc::new(transformer));
        self
    }

    /// Append an already shared transformer.
    pub fn transformer_arc(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// Register a metrics callback.
    pub fn on_metric(mut self, callback: Arc<dyn MetricsCallback>) -> Self {
        self.hooks.register_callback(callback);
        self
    }

    /// Replace the hook registry wholesale.
    pub fn hooks(mut self, hooks: MetricsHook) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn reinstate_policy(mut self, policy: ReinstatePolicy) -> Self {
        self.reinstate = policy;
        self
    }

    /// Bound each async step. Expired steps count as recoverable failures.
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        if self.step_timeout.is_some_and(|t| t.is_zero()) {
            return Err(PipelineError::InvalidConfig(
                "step_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(Pipeline {
            transformers: self.transformers,
            hooks: self.hooks,
            reinstate: self.reinstate,
            step_timeout: self.step_timeout,
            cache: self.cache,
        })
    }
}
