use chrono::Utc;
use std::sync::Arc;

use super::ChatRequest;
use crate::error::ChatError;
use crate::store::ChatStore;
use crate::types::{ChatRole, ChatThread, UserIdentity, NEW_CHAT_DEFAULT_NAME};

/// A validated turn: the caller's thread and the message to answer.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub thread: ChatThread,
    pub last_user_message: String,
}

/// Loads or lazily creates the thread for a chat turn and checks the request.
pub struct SessionGuard {
    store: Arc<dyn ChatStore>,
}

impl SessionGuard {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    pub async fn init_session(
        &self,
        user: &UserIdentity,
        request: &ChatRequest,
    ) -> Result<ChatSession, ChatError> {
        let last = request.messages.last().ok_or(ChatError::EmptyConversation)?;
        if last.role != ChatRole::User {
            return Err(ChatError::LastMessageNotFromUser { role: last.role });
        }
        if last.content.trim().is_empty() {
            return Err(ChatError::InvalidRequest("message content is empty".into()));
        }
        if request.id.trim().is_empty() {
            return Err(ChatError::InvalidRequest("thread id is required".into()));
        }
        if request.model.trim().is_empty() {
            return Err(ChatError::InvalidRequest("model is required".into()));
        }

        let existing = self
            .store
            .find_thread(&request.id)
            .await
            .map_err(|cause| ChatError::Store { cause })?;

        let thread = match existing {
            // Another user's thread is reported exactly like a missing one
            Some(thread) if thread.user_id != user.id || thread.is_deleted => {
                tracing::warn!(
                    thread_id = %request.id,
                    user_id = %user.id,
                    "Rejected chat on a thread the caller does not own"
                );
                return Err(ChatError::ThreadNotFound {
                    thread_id: request.id.clone(),
                });
            }
            Some(thread) => thread,
            None => {
                let thread = ChatThread {
                    id: request.id.clone(),
                    name: NEW_CHAT_DEFAULT_NAME.to_string(),
                    model: request.model.clone(),
                    created_at: Utc::now(),
                    user_id: user.id.clone(),
                    user_name: user.name.clone(),
                    is_deleted: false,
                    chat_type: request.chat_type,
                    conversation_style: request.conversation_style,
                };
                self.store
                    .upsert_thread(thread.clone())
                    .await
                    .map_err(|cause| ChatError::Store { cause })?;
                tracing::info!(thread_id = %thread.id, user_id = %user.id, "Created chat thread");
                thread
            }
        };

        Ok(ChatSession {
            thread,
            last_user_message: last.content.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ClientMessage;
    use crate::store::JsonChatStore;
    use crate::testing::FailingStore;
    use crate::types::{ChatType, ConversationStyle};

    fn request(messages: Vec<ClientMessage>) -> ChatRequest {
        ChatRequest {
            id: "t1".into(),
            model: "gpt-4o".into(),
            chat_type: ChatType::Document,
            conversation_style: ConversationStyle::Creative,
            messages,
        }
    }

    fn alice() -> UserIdentity {
        UserIdentity::new("alice", "Alice")
    }

    #[tokio::test]
    async fn test_creates_thread_on_first_message() {
        let store = Arc::new(JsonChatStore::in_memory());
        let guard = SessionGuard::new(store.clone());

        let session = guard
            .init_session(&alice(), &request(vec![ClientMessage::user("hello")]))
            .await
            .unwrap();
        assert_eq!(session.last_user_message, "hello");
        assert_eq!(session.thread.name, "New Chat");
        assert_eq!(session.thread.user_name, "Alice");
        assert_eq!(session.thread.chat_type, ChatType::Document);
        assert_eq!(session.thread.conversation_style, ConversationStyle::Creative);
        assert!(store.find_thread("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_existing_thread_keeps_stored_settings() {
        let store = Arc::new(JsonChatStore::in_memory());
        let guard = SessionGuard::new(store.clone());
        guard
            .init_session(&alice(), &request(vec![ClientMessage::user("first")]))
            .await
            .unwrap();

        let mut second = request(vec![ClientMessage::user("second")]);
        second.model = "gpt-35-turbo".into();
        second.conversation_style = ConversationStyle::Precise;
        let session = guard.init_session(&alice(), &second).await.unwrap();
        assert_eq!(session.thread.model, "gpt-4o");
        assert_eq!(session.thread.conversation_style, ConversationStyle::Creative);
        assert_eq!(session.last_user_message, "second");
    }

    #[tokio::test]
    async fn test_rejects_foreign_and_deleted_threads() {
        let store = Arc::new(JsonChatStore::in_memory());
        let guard = SessionGuard::new(store.clone());
        guard
            .init_session(&alice(), &request(vec![ClientMessage::user("mine")]))
            .await
            .unwrap();

        let bob = UserIdentity::new("bob", "Bob");
        let err = guard
            .init_session(&bob, &request(vec![ClientMessage::user("let me in")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ThreadNotFound { .. }));

        store.soft_delete_thread("t1", "alice").await.unwrap();
        let err = guard
            .init_session(&alice(), &request(vec![ClientMessage::user("again")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ThreadNotFound { .. }));
    }

    #[tokio::test]
    async fn test_request_validation() {
        let guard = SessionGuard::new(Arc::new(JsonChatStore::in_memory()));

        let err = guard.init_session(&alice(), &request(vec![])).await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyConversation));

        let assistant_last = vec![
            ClientMessage::user("q"),
            ClientMessage {
                id: None,
                role: ChatRole::Assistant,
                content: "a".into(),
            },
        ];
        let err = guard
            .init_session(&alice(), &request(assistant_last))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::LastMessageNotFromUser { role: ChatRole::Assistant }
        ));

        let mut no_model = request(vec![ClientMessage::user("q")]);
        no_model.model = " ".into();
        let err = guard.init_session(&alice(), &no_model).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_store_failure_is_not_validation() {
        let guard = SessionGuard::new(Arc::new(FailingStore::default()));
        let err = guard
            .init_session(&alice(), &request(vec![ClientMessage::user("q")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Store { .. }));
        assert!(!err.is_validation());
    }
}
