//! Conversation transcript collaborator.
//!
//! The engine reads the transcript to seed each turn and appends what it
//! produces. Durable storage is the host application's concern; the in-memory
//! store backs the server binary and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Content block in Anthropic Messages API shape, which every backend accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: Vec<MessageContent>,
}

impl ConversationMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![MessageContent::Text { text: text.into() }],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ConversationStore: Send + Sync + std::fmt::Debug {
    async fn load(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>, StoreError>;

    async fn append(
        &self,
        conversation_id: &str,
        message: ConversationMessage,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    conversations: Mutex<HashMap<String, Vec<ConversationMessage>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>, StoreError> {
        let conversations = self
            .conversations
            .lock()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(
        &self,
        conversation_id: &str,
        message: ConversationMessage,
    ) -> Result<(), StoreError> {
        let mut conversations = self
            .conversations
            .lock()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        conversations
            .entry(conversation_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }
}
