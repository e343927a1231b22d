use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default display name for a thread created lazily on its first message.
pub const NEW_CHAT_DEFAULT_NAME: &str = "New Chat";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Function,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Function => "function",
        }
    }
}

/// Pipeline branch a request runs through. Wire names follow the chat client
/// (`simple`, `data`, `mssql`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ChatType {
    #[default]
    #[serde(rename = "simple")]
    Simple,
    #[serde(rename = "data")]
    Document,
    #[serde(rename = "mssql")]
    StructuredQuery,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Document => "data",
            Self::StructuredQuery => "mssql",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStyle {
    Creative,
    #[default]
    Balanced,
    Precise,
}

impl ConversationStyle {
    pub const ALL: [ConversationStyle; 3] = [Self::Creative, Self::Balanced, Self::Precise];
}

/// Opaque caller identity handed in by the authentication layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatThread {
    pub id: String,
    pub name: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub user_id: String,
    pub user_name: String,
    pub is_deleted: bool,
    pub chat_type: ChatType,
    pub conversation_style: ConversationStyle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub thread_id: String,
    pub user_id: String,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_deleted: bool,
}

impl ChatMessage {
    pub fn new(
        thread_id: impl Into<String>,
        user_id: impl Into<String>,
        role: ChatRole,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            user_id: user_id.into(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            is_deleted: false,
        }
    }
}

/// Marker that a thread has indexed knowledge attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatDocument {
    pub id: String,
    pub name: String,
    pub thread_id: String,
    pub user_id: String,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatDocument {
    pub fn new(
        name: impl Into<String>,
        thread_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            thread_id: thread_id.into(),
            user_id: user_id.into(),
            is_deleted: false,
            created_at: Utc::now(),
        }
    }
}

/// One paragraph produced by extraction, tagged with its originating file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub page_content: String,
    pub file_name: String,
}

/// Vector index entry. `embedding` is left empty by the indexer and filled in
/// by the index on write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChunk {
    pub id: String,
    pub user_id: String,
    pub thread_id: String,
    pub page_content: String,
    pub file_name: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

/// A chunk returned by similarity search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: String,
    pub user_id: String,
    pub thread_id: String,
    pub page_content: String,
    pub file_name: String,
    pub score: f32,
}

/// Exact-match ownership filter applied to every similarity search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkFilter {
    pub user_id: String,
    pub thread_id: String,
}

impl ChunkFilter {
    pub fn new(user_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
        }
    }

    pub fn to_lance_predicate(&self) -> String {
        format!(
            "user_id = '{}' AND thread_id = '{}'",
            self.user_id.replace('\'', "''"),
            self.thread_id.replace('\'', "''")
        )
    }

    pub fn matches(&self, user_id: &str, thread_id: &str) -> bool {
        self.user_id == user_id && self.thread_id == thread_id
    }
}
