use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

use super::VectorIndex;
use crate::embeddings::{cosine_similarity, EmbeddingModel};
use crate::types::{ChunkFilter, DocumentChunk, SearchHit};

/// Brute-force in-process index. Nothing is persisted; contents live as long
/// as the value.
pub struct MemoryIndex {
    embedder: Arc<dyn EmbeddingModel>,
    chunks: RwLock<Vec<DocumentChunk>>,
}

impl MemoryIndex {
    pub fn new(embedder: Arc<dyn EmbeddingModel>) -> Self {
        Self {
            embedder,
            chunks: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }

    /// Snapshot of every stored chunk, in insertion order.
    pub fn chunks(&self) -> Vec<DocumentChunk> {
        self.chunks.read().clone()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn add_documents(&self, mut chunks: Vec<DocumentChunk>) -> Result<usize> {
        let texts: Vec<String> = chunks
            .iter()
            .filter(|c| c.embedding.is_empty())
            .map(|c| c.page_content.clone())
            .collect();
        let mut vectors = self.embedder.embed_documents(&texts).await?.into_iter();

        for chunk in chunks.iter_mut().filter(|c| c.embedding.is_empty()) {
            chunk.embedding = vectors
                .next()
                .ok_or_else(|| anyhow!("Embedder returned too few vectors"))?;
        }

        let len = chunks.len();
        self.chunks.write().extend(chunks);
        Ok(len)
    }

    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<SearchHit>> {
        let query_vector = self.embedder.embed_query(query).await?;

        let mut hits: Vec<SearchHit> = self
            .chunks
            .read()
            .iter()
            .filter(|c| filter.matches(&c.user_id, &c.thread_id))
            .map(|c| SearchHit {
                id: c.id.clone(),
                user_id: c.user_id.clone(),
                thread_id: c.thread_id.clone(),
                page_content: c.page_content.clone(),
                file_name: c.file_name.clone(),
                score: cosine_similarity(&query_vector, &c.embedding),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }
}
