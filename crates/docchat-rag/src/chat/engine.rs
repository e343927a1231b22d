use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

use super::chains::{CombineDocumentsChain, ConversationChain};
use super::prompts::{ChatTemplate, PromptAssembler};
use super::session::{ChatSession, SessionGuard};
use super::ChatRequest;
use crate::config::AppConfig;
use crate::error::ChatError;
use crate::llm::{
    is_sink_closed, GenerationConfig, LLMProvider, PromptMessage, ResponseStream, TokenSink,
};
use crate::search::Retriever;
use crate::storage::VectorIndex;
use crate::store::ChatStore;
use crate::types::{ChatMessage, ChatRole, ChatType, SearchHit, UserIdentity};

/// Everything a turn needs once the synchronous checks passed.
enum PreparedTurn {
    Conversation {
        messages: Vec<PromptMessage>,
    },
    Documents {
        template: ChatTemplate,
        hits: Vec<SearchHit>,
        question: String,
    },
}

impl PreparedTurn {
    async fn run(
        &self,
        conversation: &ConversationChain,
        combine: &CombineDocumentsChain,
        config: &GenerationConfig,
        sink: &mut dyn TokenSink,
    ) -> Result<String> {
        match self {
            Self::Conversation { messages } => conversation.run(messages, config, sink).await,
            Self::Documents {
                template,
                hits,
                question,
            } => combine.run(template, hits, question, config, sink).await,
        }
    }
}

/// Drives one chat turn from request to streamed, persisted answer.
pub struct ChatEngine {
    config: Arc<AppConfig>,
    store: Arc<dyn ChatStore>,
    retriever: Retriever,
    prompts: PromptAssembler,
    guard: SessionGuard,
    conversation: ConversationChain,
    combine: CombineDocumentsChain,
}

impl ChatEngine {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn ChatStore>,
        index: Arc<dyn VectorIndex>,
        llm: Arc<dyn LLMProvider>,
    ) -> Self {
        let prompts = PromptAssembler::new(&config.prompt);
        let combine = CombineDocumentsChain::new(
            llm.clone(),
            config.llm.combine_strategy,
            prompts.map_template(),
            config.llm.map_concurrency,
        );
        Self {
            retriever: Retriever::new(index, config.retrieval.top_k),
            guard: SessionGuard::new(store.clone()),
            conversation: ConversationChain::new(llm),
            combine,
            prompts,
            store,
            config,
        }
    }

    /// Validate, load context and start generation.
    ///
    /// Request, store and retrieval failures are returned here. Failures
    /// during generation arrive as the last item of the stream. The exchange
    /// is persisted once generation completes, unless the caller cancelled.
    pub async fn respond(
        &self,
        user: &UserIdentity,
        request: ChatRequest,
    ) -> Result<ResponseStream, ChatError> {
        if request.chat_type == ChatType::StructuredQuery {
            return Err(ChatError::UnsupportedChatType(request.chat_type));
        }
        let ChatSession {
            thread,
            last_user_message,
        } = self.guard.init_session(user, &request).await?;

        let generation = GenerationConfig {
            model: thread.model.clone(),
            temperature: self.config.temperatures.for_style(thread.conversation_style),
            max_tokens: self.config.llm.max_tokens,
        };
        let today = Utc::now().date_naive();

        let turn = match request.chat_type {
            ChatType::Simple => {
                // One exchange is a user message and its answer
                let history = self
                    .store
                    .recent_messages(&thread.id, &user.id, self.config.retrieval.history_window * 2)
                    .await
                    .map_err(|cause| ChatError::Store { cause })?;
                let template = self.prompts.conversation_template(&thread.model, today);
                PreparedTurn::Conversation {
                    messages: ConversationChain::prepare(&template, &history, &last_user_message),
                }
            }
            ChatType::Document => {
                let hits = self
                    .retriever
                    .retrieve(&last_user_message, &thread.id, &user.id)
                    .await
                    .map_err(|cause| {
                        tracing::error!(thread_id = %thread.id, error = %cause, "Retrieval failed");
                        ChatError::Retrieval { cause }
                    })?;
                PreparedTurn::Documents {
                    template: self.prompts.combine_template(&thread.model, today),
                    hits,
                    question: last_user_message.clone(),
                }
            }
            ChatType::StructuredQuery => {
                return Err(ChatError::UnsupportedChatType(request.chat_type));
            }
        };

        tracing::info!(
            thread_id = %thread.id,
            user_id = %user.id,
            chat_type = request.chat_type.as_str(),
            model = %generation.model,
            temperature = generation.temperature,
            "Starting chat turn"
        );

        let thread_id = thread.id.clone();
        let user_id = user.id.clone();

        let (stream, mut sink) = ResponseStream::channel();
        let cancel = sink.cancellation();
        let store = self.store.clone();
        let conversation = self.conversation.clone();
        let combine = self.combine.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = turn.run(&conversation, &combine, &generation, &mut sink) => Some(result),
            };

            match outcome {
                Some(Ok(answer)) if !cancel.is_cancelled() => {
                    // Stamped together at write time so overlapping turns on a
                    // thread never interleave
                    let question = ChatMessage::new(&thread_id, &user_id, ChatRole::User, last_user_message);
                    let reply = ChatMessage::new(&thread_id, &user_id, ChatRole::Assistant, answer);
                    if let Err(e) = store.append_exchange(question, reply).await {
                        // The caller already has the answer
                        tracing::error!(thread_id = %thread_id, error = %e, "Failed to persist chat exchange");
                    } else if sink.is_disconnected() {
                        tracing::debug!(thread_id = %thread_id, "Persisted exchange for a disconnected caller");
                    }
                }
                Some(Err(e)) if !is_sink_closed(&e) && !cancel.is_cancelled() => {
                    tracing::error!(thread_id = %thread_id, error = %e, "Generation failed");
                    sink.fail(ChatError::Generation { cause: e }).await;
                }
                _ => {
                    tracing::info!(thread_id = %thread_id, "Chat turn cancelled, nothing persisted");
                }
            }
        });

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::storage::MemoryIndex;
    use crate::store::JsonChatStore;
    use crate::testing::{FailingIndex, FailingStore, ScriptedProvider};
    use crate::types::{ConversationStyle, DocumentChunk};
    use tokio::sync::Notify;

    struct Fixture {
        engine: ChatEngine,
        store: Arc<JsonChatStore>,
        index: Arc<MemoryIndex>,
        llm: Arc<ScriptedProvider>,
    }

    fn fixture(llm: ScriptedProvider) -> Fixture {
        let store = Arc::new(JsonChatStore::in_memory());
        let index = Arc::new(MemoryIndex::new(Arc::new(HashingEmbedder::new(64))));
        let llm = Arc::new(llm);
        let engine = ChatEngine::new(
            Arc::new(AppConfig::default()),
            store.clone(),
            index.clone(),
            llm.clone(),
        );
        Fixture {
            engine,
            store,
            index,
            llm,
        }
    }

    fn alice() -> UserIdentity {
        UserIdentity::new("alice", "Alice")
    }

    fn chunk(user: &str, thread: &str, text: &str) -> DocumentChunk {
        DocumentChunk {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user.into(),
            thread_id: thread.into(),
            page_content: text.into(),
            file_name: "notes.txt".into(),
            embedding: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_simple_turn_streams_and_persists() {
        let f = fixture(ScriptedProvider::new(vec!["Hello there, Alice."]));
        let request = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Simple, "Hi");

        let answer = f.engine.respond(&alice(), request).await.unwrap().collect_text().await.unwrap();
        assert_eq!(answer, "Hello there, Alice.");

        let messages = f.store.thread_messages("t1", "alice").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[0].content, "Hi");
        assert_eq!(messages[1].role, ChatRole::Assistant);
        assert_eq!(messages[1].content, "Hello there, Alice.");
        assert!(messages[0].created_at <= messages[1].created_at);
    }

    #[tokio::test]
    async fn test_history_is_replayed_on_next_turn() {
        let f = fixture(ScriptedProvider::new(vec!["first answer", "second answer"]));
        for content in ["first question", "second question"] {
            let request = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Simple, content);
            f.engine.respond(&alice(), request).await.unwrap().collect_text().await.unwrap();
        }

        let calls = f.llm.calls();
        let second: Vec<&str> = calls[1].iter().skip(1).map(|m| m.content.as_str()).collect();
        assert_eq!(second, vec!["first question", "first answer", "second question"]);
    }

    #[tokio::test]
    async fn test_history_window_counts_exchanges() {
        let f = fixture(ScriptedProvider::new(vec!["ok"]));
        for i in 0..12 {
            f.store
                .append_exchange(
                    ChatMessage::new("t1", "alice", ChatRole::User, format!("q{}", i)),
                    ChatMessage::new("t1", "alice", ChatRole::Assistant, format!("a{}", i)),
                )
                .await
                .unwrap();
        }
        let request = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Simple, "latest");
        f.engine.respond(&alice(), request).await.unwrap().collect_text().await.unwrap();

        let prompt = &f.llm.calls()[0];
        // system + 10 exchanges + new input
        assert_eq!(prompt.len(), 22);
        assert_eq!(prompt[1].content, "q2");
        assert_eq!(prompt[2].content, "a2");
        assert_eq!(prompt[20].content, "a11");
        assert_eq!(prompt[21].content, "latest");
    }

    #[tokio::test]
    async fn test_temperature_and_model_come_from_thread() {
        let f = fixture(ScriptedProvider::new(vec!["ok"]));
        let mut request = ChatRequest::single_turn("t1", "gpt-35-turbo", ChatType::Simple, "q");
        request.conversation_style = ConversationStyle::Precise;
        f.engine.respond(&alice(), request).await.unwrap().collect_text().await.unwrap();

        let mut again = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Simple, "q2");
        again.conversation_style = ConversationStyle::Creative;
        f.engine.respond(&alice(), again).await.unwrap().collect_text().await.unwrap();

        let configs = f.llm.configs();
        assert_eq!(configs.len(), 2);
        for config in configs {
            assert_eq!(config.model, "gpt-35-turbo");
            assert!((config.temperature - 0.1).abs() < f32::EPSILON);
        }
    }

    #[tokio::test]
    async fn test_structured_query_rejected_before_anything_else() {
        let f = fixture(ScriptedProvider::new(vec!["never"]));
        let request = ChatRequest::single_turn("t1", "gpt-4o", ChatType::StructuredQuery, "select 1");
        let err = f.engine.respond(&alice(), request).await.err().unwrap();
        assert!(matches!(err, ChatError::UnsupportedChatType(ChatType::StructuredQuery)));
        assert!(f.store.find_thread("t1").await.unwrap().is_none());
        assert!(f.llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_document_turn_uses_only_thread_chunks() {
        let f = fixture(ScriptedProvider::new(vec!["The report covers revenue."]));
        f.index
            .add_documents(vec![
                chunk("alice", "t1", "quarterly revenue grew by ten percent"),
                chunk("alice", "t2", "a secret recipe for pancakes"),
                chunk("bob", "t1", "bob's private diary entry"),
            ])
            .await
            .unwrap();

        let request = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Document, "what about revenue?");
        let answer = f.engine.respond(&alice(), request).await.unwrap().collect_text().await.unwrap();
        assert_eq!(answer, "The report covers revenue.");

        for call in f.llm.calls() {
            for message in call {
                assert!(!message.content.contains("pancakes"));
                assert!(!message.content.contains("diary"));
            }
        }
        let combine = f.llm.calls().pop().unwrap();
        assert!(combine[0].content.contains("quarterly revenue"));
        assert_eq!(combine[1].content, "what about revenue?");
    }

    #[tokio::test]
    async fn test_document_turn_without_documents_still_answers() {
        let f = fixture(ScriptedProvider::new(vec!["The document may be empty."]));
        let request = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Document, "summarize");
        let answer = f.engine.respond(&alice(), request).await.unwrap().collect_text().await.unwrap();
        assert_eq!(answer, "The document may be empty.");
        assert_eq!(f.llm.calls().len(), 1);
        assert_eq!(f.store.thread_messages("t1", "alice").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retrieval_failure_is_returned_before_streaming() {
        let store = Arc::new(JsonChatStore::in_memory());
        let llm = Arc::new(ScriptedProvider::new(vec!["never"]));
        let engine = ChatEngine::new(
            Arc::new(AppConfig::default()),
            store.clone(),
            Arc::new(FailingIndex),
            llm.clone(),
        );
        let request = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Document, "q");
        let err = engine.respond(&alice(), request).await.err().unwrap();
        assert!(matches!(err, ChatError::Retrieval { .. }));
        assert!(llm.calls().is_empty());
        assert!(store.thread_messages("t1", "alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generation_failure_ends_stream_and_persists_nothing() {
        let f = fixture(ScriptedProvider::new(vec!["partial answer that breaks"]).failing_after(1));
        let request = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Simple, "q");
        let mut stream = f.engine.respond(&alice(), request).await.unwrap();

        assert!(stream.next_token().await.unwrap().is_ok());
        assert!(matches!(
            stream.next_token().await.unwrap(),
            Err(ChatError::Generation { .. })
        ));
        assert!(stream.next_token().await.is_none());
        assert!(f.store.thread_messages("t1", "alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_persists_nothing() {
        let gate = Arc::new(Notify::new());
        let f = fixture(ScriptedProvider::new(vec!["one two three four"]).paused_after_first(gate.clone()));
        let request = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Simple, "q");
        let mut stream = f.engine.respond(&alice(), request).await.unwrap();

        assert_eq!(stream.next_token().await.unwrap().unwrap(), "one ");
        stream.cancel();
        gate.notify_one();
        while stream.next_token().await.is_some() {}

        assert!(f.store.thread_messages("t1", "alice").await.unwrap().is_empty());
        // The thread itself was created when the turn started
        assert!(f.store.find_thread("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overlapping_turns_do_not_interleave() {
        let gate = Arc::new(Notify::new());
        let f = fixture(ScriptedProvider::new(vec!["slow answer here", "quick"]).paused_after_first(gate.clone()));

        let slow = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Simple, "first asked");
        let mut slow_stream = f.engine.respond(&alice(), slow).await.unwrap();
        assert_eq!(slow_stream.next_token().await.unwrap().unwrap(), "slow ");

        let quick = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Simple, "second asked");
        let answer = f.engine.respond(&alice(), quick).await.unwrap().collect_text().await.unwrap();
        assert_eq!(answer, "quick");

        gate.notify_one();
        assert_eq!(slow_stream.collect_text().await.unwrap(), "answer here");

        let contents: Vec<String> = f
            .store
            .thread_messages("t1", "alice")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["second asked", "quick", "first asked", "slow answer here"]);
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_reach_caller() {
        let llm = Arc::new(ScriptedProvider::new(vec!["answer"]));
        let engine = ChatEngine::new(
            Arc::new(AppConfig::default()),
            Arc::new(FailingStore::appends_only()),
            Arc::new(MemoryIndex::new(Arc::new(HashingEmbedder::new(16)))),
            llm,
        );
        let request = ChatRequest::single_turn("t1", "gpt-4o", ChatType::Simple, "q");
        let answer = engine.respond(&alice(), request).await.unwrap().collect_text().await.unwrap();
        assert_eq!(answer, "answer");
    }
}
