//! Narrow a large tool catalog to the tools relevant to the query.

use crate::embeddings::CachedEmbedder;
use crate::error::Result;
use crate::rt;
use crate::similarity::cosine_similarity;
use crate::snapshot::ConversationSnapshot;
use crate::transformer::{BoxFut, Transformer, TransformerResult};
use crate::turn_state::TurnState;
use crate::PipelineError;
use serde_json::{json, Value};

/// Keeps the `max_tools` tools most similar to the query.
///
/// Each tool is embedded as `"name: description"` through the shared cache,
/// so a catalog is embedded once per model. Tools scoring below `threshold`
/// are dropped even when fewer than `max_tools` remain. The selection is
/// recorded on the first message under `selected_tools` and `tools_filtered`.
///
/// Uses `TurnState::query_embedding` when present and embeds the user
/// message otherwise.
#[derive(Debug, Clone)]
pub struct ToolSelectionTransformer {
    embedder: CachedEmbedder,
    max_tools: usize,
    threshold: f32,
}

impl ToolSelectionTransformer {
    pub fn new(embedder: CachedEmbedder, max_tools: usize, threshold: f32) -> Result<Self> {
        if max_tools == 0 {
            return Err(PipelineError::InvalidConfig("max_tools must be positive".into()));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "similarity threshold must be in [0, 1], got {}",
                threshold
            )));
        }
        Ok(Self {
            embedder,
            max_tools,
            threshold,
        })
    }

    pub fn max_tools(&self) -> usize {
        self.max_tools
    }

    fn tool_text(tool: &Value) -> Option<String> {
        let name = TurnState::tool_name(tool)?;
        let description = tool
            .get("function")
            .and_then(|f| f.get("description"))
            .or_else(|| tool.get("description"))
            .and_then(Value::as_str)
            .unwrap_or("");
        Some(format!("{}: {}", name, description))
    }

    async fn select(
        &self,
        mut snapshot: ConversationSnapshot,
        state: &TurnState,
    ) -> Result<TransformerResult> {
        let fail = |e: PipelineError| PipelineError::transform(self.name(), e.to_string());

        let query = match &state.query_embedding {
            Some(q) => q.clone(),
            None if !state.user_message.is_empty() => {
                self.embedder.embed(&state.user_message).await.map_err(fail)?
            }
            None => {
                return Err(PipelineError::transform(
                    self.name(),
                    "no query to compare tools against",
                ))
            }
        };

        let named: Vec<(usize, String)> = state
            .tools
            .iter()
            .enumerate()
            .filter_map(|(i, t)| Self::tool_text(t).map(|text| (i, text)))
            .collect();
        let texts: Vec<String> = named.iter().map(|(_, text)| text.clone()).collect();
        let vectors = self.embedder.embed_all(&texts).await.map_err(fail)?;

        let mut scored: Vec<(usize, f32)> = Vec::with_capacity(named.len());
        for ((idx, _), vector) in named.iter().zip(&vectors) {
            let sim = cosine_similarity(&query, vector).map_err(fail)?;
            if sim >= self.threshold {
                scored.push((*idx, sim));
            }
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(self.max_tools);

        let selected: Vec<Value> = scored.iter().map(|(i, _)| state.tools[*i].clone()).collect();
        let names: Vec<&str> = selected.iter().filter_map(TurnState::tool_name).collect();
        let filtered = state.tools.len() - selected.len();
        tracing::debug!(
            offered = state.tools.len(),
            kept = selected.len(),
            ?names,
            "selected tools"
        );

        if let Some(first) = snapshot.iter_mut().next() {
            first.metadata.set_raw("selected_tools", json!(names));
            first.metadata.set_raw("tools_filtered", json!(filtered));
        }
        let new_state = state.clone().with_tools(selected.clone());
        Ok(TransformerResult::new(snapshot, new_state).with_metric("tools_filtered", filtered))
    }
}

impl Transformer for ToolSelectionTransformer {
    fn name(&self) -> &str {
        "tool_selection"
    }

    fn should_apply(&self, _snapshot: &ConversationSnapshot, state: &TurnState) -> bool {
        state.tools.len() > self.max_tools
    }

    fn transform(
        &self,
        snapshot: ConversationSnapshot,
        state: &TurnState,
    ) -> Result<TransformerResult> {
        rt::block_on(self.name(), self.select(snapshot, state))?
    }

    fn transform_async<'a>(
        &'a self,
        snapshot: ConversationSnapshot,
        state: &'a TurnState,
    ) -> BoxFut<'a, Result<TransformerResult>> {
        Box::pin(self.select(snapshot, state))
    }
}
