use anyhow::{anyhow, Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::path::Path;
use std::sync::Arc;

use super::VectorIndex;
use crate::embeddings::EmbeddingModel;
use crate::types::{ChunkFilter, DocumentChunk, SearchHit};

pub struct LanceStore {
    db: lancedb::Connection,
    embedder: Arc<dyn EmbeddingModel>,
    dimension: usize,
    table_name: String,
}

impl LanceStore {
    pub async fn new(path: &Path, embedder: Arc<dyn EmbeddingModel>) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create index directory {}", path.display()))?;
        let uri = path
            .to_str()
            .ok_or_else(|| anyhow!("Index path is not valid UTF-8: {}", path.display()))?;
        let db = lancedb::connect(uri)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        let store = Self {
            db,
            dimension: embedder.dimension(),
            embedder,
            table_name: "chunks".to_string(),
        };

        store.ensure_table().await?;
        Ok(store)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("user_id", DataType::Utf8, false),
            Field::new("thread_id", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("file_name", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
            Field::new("created_at", DataType::Int64, false),
        ]))
    }

    fn vector_array(&self, flat: Vec<f32>) -> FixedSizeListArray {
        FixedSizeListArray::new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            self.dimension as i32,
            Arc::new(Float32Array::from(flat)) as Arc<dyn Array>,
            None,
        )
    }

    async fn ensure_table(&self) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if names.contains(&self.table_name) {
            return Ok(());
        }

        // LanceDB infers nothing from an empty reader; seed one row then remove it
        let schema = self.schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["__seed__"])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec![""])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(self.vector_array(vec![0.0f32; self.dimension])) as Arc<dyn Array>,
                Arc::new(Int64Array::from(vec![0i64])),
            ],
        )
        .context("Failed to create seed RecordBatch")?;

        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.db
            .create_table(&self.table_name, Box::new(batches))
            .execute()
            .await
            .context("Failed to create chunks table")?;

        let table = self.db.open_table(&self.table_name).execute().await?;
        table
            .delete("id = '__seed__'")
            .await
            .context("Failed to remove seed row")?;
        Ok(())
    }

    async fn fill_embeddings(&self, chunks: &mut [DocumentChunk]) -> Result<()> {
        let missing: Vec<usize> = chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.embedding.is_empty())
            .map(|(i, _)| i)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = missing
            .iter()
            .map(|&i| chunks[i].page_content.clone())
            .collect();
        let vectors = self.embedder.embed_documents(&texts).await?;
        if vectors.len() != missing.len() {
            return Err(anyhow!(
                "Embedder returned {} vectors for {} chunks",
                vectors.len(),
                missing.len()
            ));
        }
        for (i, vector) in missing.into_iter().zip(vectors) {
            chunks[i].embedding = vector;
        }

        if let Some(bad) = chunks.iter().find(|c| c.embedding.len() != self.dimension) {
            return Err(anyhow!(
                "Chunk {} has dimension {}, index expects {}",
                bad.id,
                bad.embedding.len(),
                self.dimension
            ));
        }
        Ok(())
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        Ok(table.count_rows(None).await?)
    }
}

#[async_trait]
impl VectorIndex for LanceStore {
    async fn add_documents(&self, mut chunks: Vec<DocumentChunk>) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        self.fill_embeddings(&mut chunks).await?;

        let table = self
            .db
            .open_table(&self.table_name)
            .execute()
            .await
            .context("Failed to open chunks table")?;

        let len = chunks.len();
        let schema = self.schema();
        let now = chrono::Utc::now().timestamp();

        let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        let user_ids: Vec<&str> = chunks.iter().map(|c| c.user_id.as_str()).collect();
        let thread_ids: Vec<&str> = chunks.iter().map(|c| c.thread_id.as_str()).collect();
        let texts: Vec<&str> = chunks.iter().map(|c| c.page_content.as_str()).collect();
        let file_names: Vec<&str> = chunks.iter().map(|c| c.file_name.as_str()).collect();
        let flat_vectors: Vec<f32> = chunks
            .iter()
            .flat_map(|c| c.embedding.iter().copied())
            .collect();

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(ids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(user_ids)),
                Arc::new(StringArray::from(thread_ids)),
                Arc::new(StringArray::from(texts)),
                Arc::new(StringArray::from(file_names)),
                Arc::new(self.vector_array(flat_vectors)) as Arc<dyn Array>,
                Arc::new(Int64Array::from(vec![now; len])),
            ],
        )
        .context("Failed to create RecordBatch")?;

        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .context("Failed to insert chunks")?;

        tracing::debug!(chunks = len, "Inserted chunks into LanceDB");
        Ok(len)
    }

    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<SearchHit>> {
        let query_vector = self.embedder.embed_query(query).await?;
        let table = self.db.open_table(&self.table_name).execute().await?;

        let results = table
            .query()
            .nearest_to(query_vector.as_slice())?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(k)
            .only_if(filter.to_lance_predicate())
            .execute()
            .await
            .context("LanceDB vector search failed")?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(extract_hits_from_batches(&batches))
    }
}

/// Cosine distance is converted to a similarity score in [0, 1].
fn extract_hits_from_batches(batches: &[RecordBatch]) -> Vec<SearchHit> {
    let mut hits = Vec::new();
    for batch in batches {
        let column = |name: &str| {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        };
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let (Some(ids), Some(user_ids), Some(thread_ids), Some(texts), Some(file_names)) = (
            column("id"),
            column("user_id"),
            column("thread_id"),
            column("text"),
            column("file_name"),
        ) else {
            continue;
        };

        for i in 0..batch.num_rows() {
            let score = distances.map(|d| (1.0 - d.value(i)).max(0.0)).unwrap_or(0.0);
            hits.push(SearchHit {
                id: ids.value(i).to_string(),
                user_id: user_ids.value(i).to_string(),
                thread_id: thread_ids.value(i).to_string(),
                page_content: texts.value(i).to_string(),
                file_name: file_names.value(i).to_string(),
                score,
            });
        }
    }
    hits
}
