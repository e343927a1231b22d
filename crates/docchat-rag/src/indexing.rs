use anyhow::{Context, Result};
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::VectorIndex;
use crate::store::ChatStore;
use crate::types::{ChatDocument, DocumentChunk, UserIdentity};

/// Writes a file's chunks to the vector index and marks the thread as having
/// attached knowledge.
pub struct DocumentIndexer {
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn ChatStore>,
}

impl DocumentIndexer {
    pub fn new(index: Arc<dyn VectorIndex>, store: Arc<dyn ChatStore>) -> Self {
        Self { index, store }
    }

    /// The document record is only written after the index accepted every
    /// chunk. Returns the stored record.
    pub async fn index(
        &self,
        chunks: Vec<String>,
        file_name: &str,
        thread_id: &str,
        user: &UserIdentity,
    ) -> Result<ChatDocument> {
        let records: Vec<DocumentChunk> = chunks
            .into_iter()
            .map(|page_content| DocumentChunk {
                id: Uuid::new_v4().to_string(),
                user_id: user.id.clone(),
                thread_id: thread_id.to_string(),
                page_content,
                file_name: file_name.to_string(),
                embedding: Vec::new(),
            })
            .collect();

        let written = self
            .index
            .add_documents(records)
            .await
            .context("Vector index write failed")?;

        let document = ChatDocument::new(file_name, thread_id, &user.id);
        self.store
            .upsert_document(document.clone())
            .await
            .context("Failed to record uploaded document")?;

        tracing::info!(
            file_name = %file_name,
            thread_id = %thread_id,
            user_id = %user.id,
            chunks = written,
            "Indexed document"
        );
        Ok(document)
    }
}
