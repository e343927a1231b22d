pub mod json_store;

pub use json_store::JsonChatStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{ChatDocument, ChatMessage, ChatThread};

/// Durable store for threads, messages and document records.
///
/// Every query except [`ChatStore::find_thread`] is scoped to a user and skips
/// soft-deleted records.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Unscoped lookup, deleted records included. Ownership checks belong to
    /// the caller.
    async fn find_thread(&self, thread_id: &str) -> Result<Option<ChatThread>>;

    /// Last-writer-wins by thread id.
    async fn upsert_thread(&self, thread: ChatThread) -> Result<()>;

    /// Append a user message and its answer. Either both are stored or neither.
    async fn append_exchange(&self, user: ChatMessage, assistant: ChatMessage) -> Result<()>;

    /// The last `n` messages of a thread in creation order.
    async fn recent_messages(
        &self,
        thread_id: &str,
        user_id: &str,
        n: usize,
    ) -> Result<Vec<ChatMessage>>;

    /// Every message of a thread in creation order.
    async fn thread_messages(&self, thread_id: &str, user_id: &str) -> Result<Vec<ChatMessage>>;

    /// Last-writer-wins by document id.
    async fn upsert_document(&self, document: ChatDocument) -> Result<()>;

    async fn thread_documents(&self, thread_id: &str, user_id: &str) -> Result<Vec<ChatDocument>>;

    /// A user's threads, newest first.
    async fn user_threads(&self, user_id: &str) -> Result<Vec<ChatThread>>;

    /// Flag the thread, its messages and its documents as deleted.
    /// Returns false when the user owns no such live thread.
    async fn soft_delete_thread(&self, thread_id: &str, user_id: &str) -> Result<bool>;
}
