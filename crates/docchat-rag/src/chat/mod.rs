pub mod chains;
pub mod engine;
pub mod prompts;
pub mod session;

pub use chains::{CombineDocumentsChain, ConversationChain};
pub use engine::ChatEngine;
pub use prompts::{knowledge_cutoff_clause, ChatTemplate, PromptAssembler};
pub use session::{ChatSession, SessionGuard};

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, ChatRole, ChatThread, ChatType, ConversationStyle};

// ============================================================================
// Types
// ============================================================================

/// Body of a chat turn as posted by the client. `id` is the thread id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub chat_type: ChatType,
    #[serde(default)]
    pub conversation_style: ConversationStyle,
    pub messages: Vec<ClientMessage>,
}

impl ChatRequest {
    /// A request carrying a single user message.
    pub fn single_turn(
        thread_id: impl Into<String>,
        model: impl Into<String>,
        chat_type: ChatType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: thread_id.into(),
            model: model.into(),
            chat_type,
            conversation_style: ConversationStyle::default(),
            messages: vec![ClientMessage::user(content)],
        }
    }
}

/// Message in the shape the chat client renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: ChatRole,
    pub content: String,
}

impl ClientMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: None,
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

impl From<&ChatMessage> for ClientMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            id: Some(message.id.clone()),
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Re-hydrate a chat view from stored messages.
pub fn to_client_messages(messages: &[ChatMessage]) -> Vec<ClientMessage> {
    messages.iter().map(ClientMessage::from).collect()
}

/// A thread with its full transcript, for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadReport {
    pub thread: ChatThread,
    pub messages: Vec<ChatMessage>,
}
