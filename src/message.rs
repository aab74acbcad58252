//! Messages and their metadata.
//!
//! A [`Message`] is one turn's content. Its role, content and creation turn
//! are fixed at construction; its [`MessageMetadata`] and embedding are the
//! only parts transformers may change in place, through [`MessageMut`].

use crate::backend::ChatMessage;
use crate::error::Result;
use crate::PipelineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// The role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) response.
    Assistant,
    /// Tool/function result.
    Tool,
}

impl Role {
    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Role::System)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(PipelineError::InvalidConfig(format!(
                "invalid role '{}', expected one of system, user, assistant, tool",
                other
            ))),
        }
    }
}

/// Per-message annotations.
///
/// Holds the global `prominence` score plus named namespaces where
/// transformers keep their own typed annotations. Deserialized prominence
/// goes through [`set_prominence`](Self::set_prominence).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMetadata")]
pub struct MessageMetadata {
    prominence: f64,
    namespaces: HashMap<String, Value>,
}

fn default_prominence() -> f64 {
    1.0
}

#[derive(Deserialize)]
struct RawMetadata {
    #[serde(default = "default_prominence")]
    prominence: f64,
    #[serde(default)]
    namespaces: HashMap<String, Value>,
}

impl TryFrom<RawMetadata> for MessageMetadata {
    type Error = PipelineError;

    fn try_from(raw: RawMetadata) -> Result<Self> {
        let mut meta = MessageMetadata {
            prominence: 1.0,
            namespaces: raw.namespaces,
        };
        meta.set_prominence(raw.prominence)?;
        Ok(meta)
    }
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            prominence: 1.0,
            namespaces: HashMap::new(),
        }
    }
}

impl MessageMetadata {
    /// Relevance score in `[0.0, 1.0]`.
    pub fn prominence(&self) -> f64 {
        self.prominence
    }

    /// Set the relevance score. Values above 1.0 are clamped.
    pub fn set_prominence(&mut self, value: f64) -> Result<()> {
        if value.is_nan() || value < 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "prominence must be >= 0.0, got {}",
                value
            )));
        }
        self.prominence = value.min(1.0);
        Ok(())
    }

    /// Multiply prominence by a non-negative factor.
    pub fn scale_prominence(&mut self, factor: f64) -> Result<()> {
        self.set_prominence(self.prominence * factor)
    }

    /// Read a typed namespace. `Ok(None)` when the namespace is absent.
    pub fn namespace<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.namespaces.get(name) {
            Some(raw) => Ok(Some(serde_json::from_value(raw.clone())?)),
            None => Ok(None),
        }
    }

    /// Store a typed namespace, replacing any previous value.
    pub fn set_namespace<T: Serialize>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<()> {
        self.namespaces.insert(name.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Store a raw JSON annotation.
    pub fn set_raw(&mut self, name: impl Into<String>, value: Value) {
        self.namespaces.insert(name.into(), value);
    }

    /// Read a raw JSON annotation.
    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.namespaces.get(name)
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.contains_key(name)
    }
}

/// One conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    role: Role,
    content: String,
    turn_index: u64,
    /// Semantic vector, absent until computed.
    pub embedding: Option<Vec<f32>>,
    /// Mutable annotations (prominence and transformer namespaces).
    pub metadata: MessageMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl Message {
    /// Create a message at turn 0 with a fresh id.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            role,
            content: content.into(),
            turn_index: 0,
            embedding: None,
            metadata: MessageMetadata::default(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Use a caller-supplied id instead of the generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the turn at which the message was created.
    pub fn at_turn(mut self, turn_index: u64) -> Self {
        self.turn_index = turn_index;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_prominence(mut self, prominence: f64) -> Result<Self> {
        self.metadata.set_prominence(prominence)?;
        Ok(self)
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<Value>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn turn_index(&self) -> u64 {
        self.turn_index
    }

    pub fn is_system(&self) -> bool {
        self.role.is_system()
    }

    pub fn tool_calls(&self) -> Option<&[Value]> {
        self.tool_calls.as_deref()
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        self.tool_call_id.as_deref()
    }

    /// Convert to the completion API message shape.
    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
        }
    }

    /// Build a message from the completion API message shape.
    pub fn from_chat(chat: ChatMessage) -> Self {
        let mut msg = Self::new(chat.role, chat.content);
        msg.tool_calls = chat.tool_calls;
        msg.tool_call_id = chat.tool_call_id;
        msg
    }

    pub(crate) fn view_mut(&mut self) -> MessageMut<'_> {
        MessageMut {
            id: &self.id,
            role: self.role,
            content: &self.content,
            turn_index: self.turn_index,
            embedding: &mut self.embedding,
            metadata: &mut self.metadata,
        }
    }
}

/// Mutable view of a message held by a snapshot.
///
/// Only the embedding and metadata are writable; the message itself cannot
/// be replaced, so snapshot ids stay unique.
#[derive(Debug)]
pub struct MessageMut<'a> {
    id: &'a str,
    role: Role,
    content: &'a str,
    turn_index: u64,
    pub embedding: &'a mut Option<Vec<f32>>,
    pub metadata: &'a mut MessageMetadata,
}

impl MessageMut<'_> {
    pub fn id(&self) -> &str {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        self.content
    }

    pub fn turn_index(&self) -> u64 {
        self.turn_index
    }

    pub fn is_system(&self) -> bool {
        self.role.is_system()
    }
}
