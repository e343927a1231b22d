use anyhow::Result;
use std::sync::Arc;

use crate::storage::VectorIndex;
use crate::types::{ChunkFilter, SearchHit};

/// Similarity search scoped to one (user, thread) pair.
pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    k: usize,
}

impl Retriever {
    pub fn new(index: Arc<dyn VectorIndex>, k: usize) -> Self {
        Self { index, k }
    }

    /// At most `k` hits, best first. An empty result is not an error.
    pub async fn retrieve(
        &self,
        query: &str,
        thread_id: &str,
        user_id: &str,
    ) -> Result<Vec<SearchHit>> {
        let filter = ChunkFilter::new(user_id, thread_id);
        let raw = self.index.similarity_search(query, self.k, &filter).await?;
        let returned = raw.len();

        // The index applies the filter too; rows that slip through are dropped
        let mut hits: Vec<SearchHit> = raw
            .into_iter()
            .filter(|h| filter.matches(&h.user_id, &h.thread_id))
            .collect();
        if hits.len() != returned {
            tracing::warn!(
                thread_id = %thread_id,
                dropped = returned - hits.len(),
                "Vector index returned chunks outside the requested scope"
            );
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(self.k);

        tracing::debug!(thread_id = %thread_id, hits = hits.len(), "Retrieved chunks");
        Ok(hits)
    }
}
