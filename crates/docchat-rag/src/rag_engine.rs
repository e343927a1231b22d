use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

use crate::chat::{to_client_messages, ChatEngine, ChatRequest, ClientMessage, ThreadReport};
use crate::config::AppConfig;
use crate::embeddings::{EmbeddingModel, HashingEmbedder, OpenAiEmbeddings};
use crate::error::{ChatError, UploadError};
use crate::indexing::DocumentIndexer;
use crate::llm::{ExternalProvider, LLMProvider, ResponseStream};
use crate::processing::{
    ContentExtractor, DocumentAnalyzer, FormRecognizerClient, PdfTextAnalyzer, TextChunker,
    UploadedFile,
};
use crate::storage::{LanceStore, VectorIndex};
use crate::store::{ChatStore, JsonChatStore};
use crate::types::{ChatDocument, ChatThread, UserIdentity};

/// External capabilities the pipeline runs against.
#[derive(Clone)]
pub struct Capabilities {
    pub analyzer: Arc<dyn DocumentAnalyzer>,
    pub index: Arc<dyn VectorIndex>,
    pub store: Arc<dyn ChatStore>,
    pub llm: Arc<dyn LLMProvider>,
}

/// Document upload and grounded chat over per-thread knowledge.
pub struct RagChat {
    store: Arc<dyn ChatStore>,
    extractor: ContentExtractor,
    chunker: TextChunker,
    indexer: DocumentIndexer,
    engine: ChatEngine,
}

impl RagChat {
    pub fn new(config: Arc<AppConfig>, capabilities: Capabilities) -> Self {
        let Capabilities {
            analyzer,
            index,
            store,
            llm,
        } = capabilities;

        Self {
            extractor: ContentExtractor::new(analyzer, config.upload.max_document_size),
            chunker: TextChunker::from_config(&config.chunking),
            indexer: DocumentIndexer::new(index.clone(), store.clone()),
            engine: ChatEngine::new(config, store.clone(), index, llm),
            store,
        }
    }

    /// Wire up the configured services under `config.data_dir`.
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        config.validate().map_err(|e| anyhow!("Invalid configuration: {}", e))?;
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Failed to create data directory {}", config.data_dir.display())
        })?;

        let analyzer: Arc<dyn DocumentAnalyzer> = match &config.document_analysis {
            Some(analysis) => Arc::new(
                FormRecognizerClient::new(analysis.clone())
                    .context("Failed to initialize document analysis client")?,
            ),
            None => {
                tracing::warn!("No document analysis service configured, using local PDF text extraction");
                Arc::new(PdfTextAnalyzer::new())
            }
        };

        let embedder: Arc<dyn EmbeddingModel> = if config.embedding.base_url.is_some() {
            Arc::new(
                OpenAiEmbeddings::new(&config.embedding)
                    .context("Failed to initialize embedding client")?,
            )
        } else {
            tracing::warn!(
                dimension = config.embedding.dimension,
                "No embedding service configured, using hashing embeddings"
            );
            Arc::new(HashingEmbedder::new(config.embedding.dimension))
        };

        let index = LanceStore::new(&config.data_dir.join("vectors"), embedder)
            .await
            .context("Failed to initialize LanceDB store")?;
        let store = JsonChatStore::open(&config.data_dir.join("chat.json"))
            .context("Failed to open chat store")?;
        let llm = ExternalProvider::new(&config.llm).context("Failed to initialize LLM provider")?;

        tracing::info!(
            data_dir = %config.data_dir.display(),
            provider = %llm.info().name,
            "RAG chat initialized"
        );

        Ok(Self::new(
            Arc::new(config),
            Capabilities {
                analyzer,
                index: Arc::new(index),
                store: Arc::new(store),
                llm: Arc::new(llm),
            },
        ))
    }

    /// Extract, split and index one file into a thread's knowledge.
    /// Returns the file name on success.
    pub async fn upload_document(
        &self,
        user: &UserIdentity,
        thread_id: Option<&str>,
        file: Option<UploadedFile>,
    ) -> Result<String, UploadError> {
        let file = file.ok_or(UploadError::MissingFile)?;
        let thread_id = thread_id
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(UploadError::MissingThread)?;

        let documents = self.extractor.extract(Some(&file)).await?;
        let chunks = self.chunker.split_documents(&documents);
        tracing::debug!(
            file_name = %file.name,
            paragraphs = documents.len(),
            chunks = chunks.len(),
            "Split document"
        );

        self.indexer
            .index(chunks, &file.name, thread_id, user)
            .await
            .map_err(|cause| {
                tracing::error!(file_name = %file.name, thread_id = %thread_id, error = %cause, "Indexing failed");
                UploadError::Indexing { cause }
            })?;

        Ok(file.name)
    }

    /// Answer the last user message of `request` as a token stream.
    pub async fn chat(
        &self,
        user: &UserIdentity,
        request: ChatRequest,
    ) -> Result<ResponseStream, ChatError> {
        self.engine.respond(user, request).await
    }

    pub async fn list_threads(&self, user: &UserIdentity) -> Result<Vec<ChatThread>, ChatError> {
        self.store
            .user_threads(&user.id)
            .await
            .map_err(|cause| ChatError::Store { cause })
    }

    /// A thread with its full transcript. Threads the caller does not own are
    /// reported as missing.
    pub async fn thread_report(
        &self,
        user: &UserIdentity,
        thread_id: &str,
    ) -> Result<ThreadReport, ChatError> {
        let thread = self.owned_thread(user, thread_id).await?;
        let messages = self
            .store
            .thread_messages(thread_id, &user.id)
            .await
            .map_err(|cause| ChatError::Store { cause })?;
        Ok(ThreadReport { thread, messages })
    }

    /// Stored transcript in the client's message shape.
    pub async fn client_messages(
        &self,
        user: &UserIdentity,
        thread_id: &str,
    ) -> Result<Vec<ClientMessage>, ChatError> {
        let report = self.thread_report(user, thread_id).await?;
        Ok(to_client_messages(&report.messages))
    }

    pub async fn thread_documents(
        &self,
        user: &UserIdentity,
        thread_id: &str,
    ) -> Result<Vec<ChatDocument>, ChatError> {
        self.owned_thread(user, thread_id).await?;
        self.store
            .thread_documents(thread_id, &user.id)
            .await
            .map_err(|cause| ChatError::Store { cause })
    }

    /// Soft delete; indexed chunks stay in the vector store.
    pub async fn delete_thread(&self, user: &UserIdentity, thread_id: &str) -> Result<(), ChatError> {
        let deleted = self
            .store
            .soft_delete_thread(thread_id, &user.id)
            .await
            .map_err(|cause| ChatError::Store { cause })?;
        if !deleted {
            return Err(ChatError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            });
        }
        tracing::info!(thread_id = %thread_id, user_id = %user.id, "Deleted chat thread");
        Ok(())
    }

    async fn owned_thread(&self, user: &UserIdentity, thread_id: &str) -> Result<ChatThread, ChatError> {
        match self.store.find_thread(thread_id).await {
            Ok(Some(thread)) if thread.user_id == user.id && !thread.is_deleted => Ok(thread),
            Ok(_) => Err(ChatError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            }),
            Err(cause) => Err(ChatError::Store { cause }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::parser::build_docx;
    use crate::storage::MemoryIndex;
    use crate::testing::{FailingIndex, ScriptedProvider};
    use crate::types::{ChatRole, ChatType};
    use std::time::Duration;

    struct Harness {
        rag: RagChat,
        store: Arc<JsonChatStore>,
        index: Arc<MemoryIndex>,
        llm: Arc<ScriptedProvider>,
    }

    fn harness(llm: ScriptedProvider) -> Harness {
        let store = Arc::new(JsonChatStore::in_memory());
        let index = Arc::new(MemoryIndex::new(Arc::new(HashingEmbedder::new(128))));
        let llm = Arc::new(llm);
        let rag = RagChat::new(
            Arc::new(AppConfig::default()),
            Capabilities {
                analyzer: Arc::new(PdfTextAnalyzer::new()),
                index: index.clone(),
                store: store.clone(),
                llm: llm.clone(),
            },
        );
        Harness {
            rag,
            store,
            index,
            llm,
        }
    }

    fn alice() -> UserIdentity {
        UserIdentity::new("alice", "Alice")
    }

    fn text_file(name: &str, text: &str) -> UploadedFile {
        UploadedFile::new(name, "text/plain", text.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_upload_then_ask_about_it() {
        let h = harness(ScriptedProvider::new(vec!["The launch is planned for March."]));
        let name = h
            .rag
            .upload_document(
                &alice(),
                Some("t1"),
                Some(text_file("plan.txt", "Project Falcon\n\nThe launch is planned for March.")),
            )
            .await
            .unwrap();
        assert_eq!(name, "plan.txt");
        assert_eq!(h.index.len(), 1);
        let chunk = &h.index.chunks()[0];
        assert_eq!(chunk.page_content, "Project Falcon\nThe launch is planned for March.");
        assert_eq!(chunk.thread_id, "t1");

        let documents = h.store.thread_documents("t1", "alice").await.unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].name, "plan.txt");

        let request = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Document, "When is the launch?");
        let answer = h.rag.chat(&alice(), request).await.unwrap().collect_text().await.unwrap();
        assert_eq!(answer, "The launch is planned for March.");
        assert!(h.llm.calls().last().unwrap()[0].content.contains("planned for March"));
    }

    #[tokio::test]
    async fn test_upload_docx() {
        let h = harness(ScriptedProvider::new(vec!["ok"]));
        let bytes = build_docx(&["Quarterly numbers", "Revenue is up."]);
        let file = UploadedFile::new(
            "q3.docx",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            bytes,
        );
        h.rag.upload_document(&alice(), Some("t1"), Some(file)).await.unwrap();
        assert_eq!(h.index.chunks()[0].page_content, "Quarterly numbers\nRevenue is up.");
    }

    #[tokio::test]
    async fn test_upload_validation_order() {
        let h = harness(ScriptedProvider::new(vec!["ok"]));
        let err = h.rag.upload_document(&alice(), None, None).await.unwrap_err();
        assert!(matches!(err, UploadError::MissingFile));

        let err = h
            .rag
            .upload_document(&alice(), Some("  "), Some(text_file("a.txt", "x")))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::MissingThread));

        let err = h
            .rag
            .upload_document(
                &alice(),
                Some("t1"),
                Some(UploadedFile::new("a.zip", "application/zip", vec![1, 2, 3])),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidFileType { .. }));
        assert!(h.index.is_empty());
        assert!(h.store.thread_documents("t1", "alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_whitespace_only_file_has_no_text() {
        let h = harness(ScriptedProvider::new(vec!["ok"]));
        let err = h
            .rag
            .upload_document(&alice(), Some("t1"), Some(text_file("blank.txt", " \n\n \n")))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NoExtractableText));
        assert!(h.index.is_empty());
    }

    #[tokio::test]
    async fn test_index_failure_records_no_document() {
        let store = Arc::new(JsonChatStore::in_memory());
        let rag = RagChat::new(
            Arc::new(AppConfig::default()),
            Capabilities {
                analyzer: Arc::new(PdfTextAnalyzer::new()),
                index: Arc::new(FailingIndex),
                store: store.clone(),
                llm: Arc::new(ScriptedProvider::new(vec!["ok"])),
            },
        );
        let err = rag
            .upload_document(&alice(), Some("t1"), Some(text_file("a.txt", "some text")))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Indexing { .. }));
        assert!(store.thread_documents("t1", "alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_threads_are_private() {
        let h = harness(ScriptedProvider::new(vec!["hi"]));
        let request = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Simple, "hello");
        h.rag.chat(&alice(), request).await.unwrap().collect_text().await.unwrap();

        let bob = UserIdentity::new("bob", "Bob");
        assert!(h.rag.list_threads(&bob).await.unwrap().is_empty());
        assert!(matches!(
            h.rag.thread_report(&bob, "t1").await,
            Err(ChatError::ThreadNotFound { .. })
        ));
        assert!(matches!(
            h.rag.delete_thread(&bob, "t1").await,
            Err(ChatError::ThreadNotFound { .. })
        ));

        let report = h.rag.thread_report(&alice(), "t1").await.unwrap();
        assert_eq!(report.thread.name, "New Chat");
        assert_eq!(report.messages.len(), 2);
        let client = h.rag.client_messages(&alice(), "t1").await.unwrap();
        assert_eq!(client[1].role, ChatRole::Assistant);
        assert_eq!(client[1].content, "hi");
    }

    #[tokio::test]
    async fn test_delete_hides_thread() {
        let h = harness(ScriptedProvider::new(vec!["hi"]));
        let request = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Simple, "hello");
        h.rag.chat(&alice(), request).await.unwrap().collect_text().await.unwrap();

        h.rag.delete_thread(&alice(), "t1").await.unwrap();
        assert!(h.rag.list_threads(&alice()).await.unwrap().is_empty());
        assert!(matches!(
            h.rag.thread_documents(&alice(), "t1").await,
            Err(ChatError::ThreadNotFound { .. })
        ));
        let again = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Simple, "still there?");
        assert!(matches!(
            h.rag.chat(&alice(), again).await.err(),
            Some(ChatError::ThreadNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_stream_still_persists() {
        let h = harness(ScriptedProvider::new(vec!["a long answer nobody reads"]));
        let request = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Simple, "q");
        let stream = h.rag.chat(&alice(), request).await.unwrap();
        drop(stream);

        let mut stored = Vec::new();
        for _ in 0..50 {
            stored = h.store.thread_messages("t1", "alice").await.unwrap();
            if !stored.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content, "a long answer nobody reads");
    }
}
