//! Ordered conversation snapshot.

use crate::backend::ChatMessage;
use crate::error::Result;
use crate::message::{Message, MessageMut, Role};
use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The ordered messages of a conversation at one point in a pipeline run.
///
/// Message ids are unique within a snapshot; every insertion path checks
/// it, deserialization included. Order is meaningful (chronological unless a
/// transformer reorders).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSnapshot")]
pub struct ConversationSnapshot {
    messages: Vec<Message>,
    max_tokens: Option<usize>,
}

#[derive(Deserialize)]
struct RawSnapshot {
    messages: Vec<Message>,
    #[serde(default)]
    max_tokens: Option<usize>,
}

impl TryFrom<RawSnapshot> for ConversationSnapshot {
    type Error = PipelineError;

    fn try_from(raw: RawSnapshot) -> Result<Self> {
        let snapshot = Self::from_messages(raw.messages)?;
        Ok(match raw.max_tokens {
            Some(limit) => snapshot.with_max_tokens(limit),
            None => snapshot,
        })
    }
}

impl ConversationSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from messages, rejecting duplicate ids.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(messages.len());
        for msg in &messages {
            if !seen.insert(msg.id()) {
                return Err(PipelineError::DuplicateMessage(msg.id().to_string()));
            }
        }
        Ok(Self {
            messages,
            max_tokens: None,
        })
    }

    /// Attach a token budget (informational; transformers may read it).
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn max_tokens(&self) -> Option<usize> {
        self.max_tokens
    }

    /// Append a message.
    pub fn push(&mut self, message: Message) -> Result<()> {
        self.ensure_absent(message.id())?;
        self.messages.push(message);
        Ok(())
    }

    /// Insert a message at `position` (clamped to the end).
    pub fn insert(&mut self, position: usize, message: Message) -> Result<()> {
        self.ensure_absent(message.id())?;
        let position = position.min(self.messages.len());
        self.messages.insert(position, message);
        Ok(())
    }

    /// Remove a message by id, returning it if present.
    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let pos = self.position(id)?;
        Some(self.messages.remove(pos))
    }

    /// Keep only the messages matching `keep`.
    pub fn retain(&mut self, keep: impl FnMut(&Message) -> bool) {
        self.messages.retain(keep);
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id() == id)
    }

    /// Metadata and embedding of a message by id.
    pub fn get_mut(&mut self, id: &str) -> Option<MessageMut<'_>> {
        self.messages.iter_mut().find(|m| m.id() == id).map(Message::view_mut)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// Index of a message by id.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id() == id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Metadata and embedding of every message, in order.
    ///
    /// Messages cannot be replaced through the yielded views.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = MessageMut<'_>> {
        self.messages.iter_mut().map(Message::view_mut)
    }

    pub fn by_role(&self, role: Role) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(move |m| m.role() == role)
    }

    pub fn non_system_count(&self) -> usize {
        self.messages.iter().filter(|m| !m.is_system()).count()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Render to the completion API message list (role, content, order).
    pub fn render(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(Message::to_chat).collect()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    fn ensure_absent(&self, id: &str) -> Result<()> {
        if self.contains(id) {
            return Err(PipelineError::DuplicateMessage(id.to_string()));
        }
        Ok(())
    }
}
