pub mod chat;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod indexing;
pub mod llm;
pub mod processing;
pub mod rag_engine;
pub mod search;
pub mod storage;
pub mod store;
pub mod types;

// Re-export primary types for convenience
pub use chat::{ChatRequest, ClientMessage, ThreadReport};
pub use config::AppConfig;
pub use error::{ChatError, UploadError};
pub use llm::ResponseStream;
pub use processing::UploadedFile;
pub use rag_engine::{Capabilities, RagChat};
pub use types::{
    ChatDocument, ChatMessage, ChatRole, ChatThread, ChatType, ConversationStyle, UserIdentity,
};

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted capabilities shared by unit tests.

    use anyhow::{anyhow, bail, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::Notify;

    use crate::llm::{GenerationConfig, LLMProvider, PromptMessage, ProviderInfo, TokenSink};
    use crate::storage::VectorIndex;
    use crate::store::{ChatStore, JsonChatStore};
    use crate::types::{ChatDocument, ChatMessage, ChatThread, ChunkFilter, DocumentChunk, SearchHit};

    /// Replays canned answers word by word. Non-streamed calls echo the
    /// system prompt so map steps are traceable.
    pub struct ScriptedProvider {
        responses: Mutex<VecDeque<String>>,
        calls: Mutex<Vec<Vec<PromptMessage>>>,
        configs: Mutex<Vec<GenerationConfig>>,
        fail_after: Option<usize>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedProvider {
        pub fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
                calls: Mutex::new(Vec::new()),
                configs: Mutex::new(Vec::new()),
                fail_after: None,
                gate: None,
            }
        }

        /// Error out after `tokens` tokens were sent.
        pub fn failing_after(mut self, tokens: usize) -> Self {
            self.fail_after = Some(tokens);
            self
        }

        /// Block after the first token until `gate` is notified.
        pub fn paused_after_first(mut self, gate: Arc<Notify>) -> Self {
            self.gate = Some(gate);
            self
        }

        pub fn calls(&self) -> Vec<Vec<PromptMessage>> {
            self.calls.lock().clone()
        }

        /// Configs of streamed calls only.
        pub fn configs(&self) -> Vec<GenerationConfig> {
            self.configs.lock().clone()
        }

        fn next_response(&self) -> String {
            let mut responses = self.responses.lock();
            // The last answer repeats once the script runs out
            if responses.len() > 1 {
                responses.pop_front().unwrap_or_default()
            } else {
                responses.front().cloned().unwrap_or_default()
            }
        }
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        async fn stream_chat(
            &self,
            messages: &[PromptMessage],
            config: &GenerationConfig,
            sink: &mut dyn TokenSink,
        ) -> Result<String> {
            self.calls.lock().push(messages.to_vec());
            self.configs.lock().push(config.clone());
            let response = self.next_response();

            let mut full = String::new();
            for (i, token) in response.split_inclusive(' ').enumerate() {
                if self.fail_after == Some(i) {
                    bail!("scripted provider failure");
                }
                if i == 1 {
                    if let Some(gate) = &self.gate {
                        gate.notified().await;
                    }
                }
                sink.send_token(token).await?;
                full.push_str(token);
            }
            Ok(full)
        }

        async fn complete(&self, messages: &[PromptMessage], _config: &GenerationConfig) -> Result<String> {
            self.calls.lock().push(messages.to_vec());
            Ok(messages
                .first()
                .map(|m| m.content.clone())
                .unwrap_or_default())
        }

        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                name: "scripted".into(),
                endpoint: "memory".into(),
                supports_streaming: true,
            }
        }
    }

    /// Vector index that is always down.
    pub struct FailingIndex;

    #[async_trait]
    impl VectorIndex for FailingIndex {
        async fn add_documents(&self, _chunks: Vec<DocumentChunk>) -> Result<usize> {
            Err(anyhow!("vector index unavailable"))
        }

        async fn similarity_search(
            &self,
            _query: &str,
            _k: usize,
            _filter: &ChunkFilter,
        ) -> Result<Vec<SearchHit>> {
            Err(anyhow!("vector index unavailable"))
        }
    }

    /// Store that fails every call, or only `append_exchange` when built with
    /// [`FailingStore::appends_only`].
    pub struct FailingStore {
        inner: JsonChatStore,
        appends_only: bool,
    }

    impl Default for FailingStore {
        fn default() -> Self {
            Self {
                inner: JsonChatStore::in_memory(),
                appends_only: false,
            }
        }
    }

    impl FailingStore {
        pub fn appends_only() -> Self {
            Self {
                appends_only: true,
                ..Self::default()
            }
        }

        fn check(&self) -> Result<()> {
            if self.appends_only {
                Ok(())
            } else {
                Err(anyhow!("chat store unavailable"))
            }
        }
    }

    #[async_trait]
    impl ChatStore for FailingStore {
        async fn find_thread(&self, thread_id: &str) -> Result<Option<ChatThread>> {
            self.check()?;
            self.inner.find_thread(thread_id).await
        }

        async fn upsert_thread(&self, thread: ChatThread) -> Result<()> {
            self.check()?;
            self.inner.upsert_thread(thread).await
        }

        async fn append_exchange(&self, _user: ChatMessage, _assistant: ChatMessage) -> Result<()> {
            Err(anyhow!("chat store rejected the write"))
        }

        async fn recent_messages(
            &self,
            thread_id: &str,
            user_id: &str,
            n: usize,
        ) -> Result<Vec<ChatMessage>> {
            self.check()?;
            self.inner.recent_messages(thread_id, user_id, n).await
        }

        async fn thread_messages(&self, thread_id: &str, user_id: &str) -> Result<Vec<ChatMessage>> {
            self.check()?;
            self.inner.thread_messages(thread_id, user_id).await
        }

        async fn upsert_document(&self, document: ChatDocument) -> Result<()> {
            self.check()?;
            self.inner.upsert_document(document).await
        }

        async fn thread_documents(&self, thread_id: &str, user_id: &str) -> Result<Vec<ChatDocument>> {
            self.check()?;
            self.inner.thread_documents(thread_id, user_id).await
        }

        async fn user_threads(&self, user_id: &str) -> Result<Vec<ChatThread>> {
            self.check()?;
            self.inner.user_threads(user_id).await
        }

        async fn soft_delete_thread(&self, thread_id: &str, user_id: &str) -> Result<bool> {
            self.check()?;
            self.inner.soft_delete_thread(thread_id, user_id).await
        }
    }
}
