pub mod lance_store;
pub mod memory_index;

pub use lance_store::LanceStore;
pub use memory_index::MemoryIndex;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{ChunkFilter, DocumentChunk, SearchHit};

/// Vector index capability. Implementations compute embeddings on write for
/// chunks that arrive without one.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Write a batch of chunks; all or nothing. Returns the number written.
    async fn add_documents(&self, chunks: Vec<DocumentChunk>) -> Result<usize>;

    /// Up to `k` nearest chunks matching `filter` exactly, best first.
    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<SearchHit>>;
}
