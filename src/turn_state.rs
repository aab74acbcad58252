//! Per-call turn metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Metadata for the current call, separate from the conversation history.
///
/// Transformers receive `&TurnState` and never mutate it; one that needs a
/// change builds a new value with the consuming `with_*` methods and returns
/// it in its [`TransformerResult`](crate::TransformerResult).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnState {
    /// Raw text of the active user input.
    pub user_message: String,
    /// Current turn index (monotonic).
    pub turn_index: u64,
    /// Embedding of the active user input, if computed.
    pub query_embedding: Option<Vec<f32>>,
    /// Tool/function descriptors in the completion API's JSON shape.
    #[serde(default)]
    pub tools: Vec<Value>,
    /// Open extension map for transformer-specific data.
    #[serde(default)]
    pub extensions: HashMap<String, Value>,
}

impl TurnState {
    pub fn new(user_message: impl Into<String>, turn_index: u64) -> Self {
        Self {
            user_message: user_message.into(),
            turn_index,
            ..Default::default()
        }
    }

    pub fn with_query_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.query_embedding = Some(embedding);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Name of a tool descriptor (`function.name` or top-level `name`).
    pub fn tool_name(tool: &Value) -> Option<&str> {
        tool.get("function")
            .and_then(|f| f.get("name"))
            .or_else(|| tool.get("name"))
            .and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_methods_produce_new_values() {
        let original = TurnState::new("hi", 3);
        let updated = original.clone().with_tools(vec![json!({"name": "search"})]);
        assert!(original.tools.is_empty());
        assert_eq!(updated.tools.len(), 1);
        assert_eq!(updated.turn_index, 3);
    }

    #[test]
    fn test_tool_name_shapes() {
        let openai = json!({"type": "function", "function": {"name": "get_weather"}});
        let flat = json!({"name": "search"});
        assert_eq!(TurnState::tool_name(&openai), Some("get_weather"));
        assert_eq!(TurnState::tool_name(&flat), Some("search"));
        assert_eq!(TurnState::tool_name(&json!({})), None);
    }
}
