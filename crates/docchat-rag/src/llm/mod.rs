//! LLM Module - chat-completion providers and token streaming

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod external;
pub mod streaming;

pub use external::ExternalProvider;
pub use streaming::{ChannelSink, ResponseStream};

use crate::types::ChatRole;

/// One message of a chat-completion prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: ChatRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

/// Generation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
}

/// The receiving side went away for good; the provider should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("token sink closed")]
pub struct SinkClosed;

/// True when an error chain ends in a closed sink, i.e. the caller cancelled.
pub fn is_sink_closed(error: &anyhow::Error) -> bool {
    error.chain().any(|e| e.downcast_ref::<SinkClosed>().is_some())
}

/// Destination for generated tokens, owned by whoever drives the model call.
#[async_trait]
pub trait TokenSink: Send {
    async fn send_token(&mut self, token: &str) -> Result<(), SinkClosed>;
}

/// Sink for calls whose output is only needed as a whole.
#[derive(Debug, Default)]
pub struct DiscardSink;

#[async_trait]
impl TokenSink for DiscardSink {
    async fn send_token(&mut self, _token: &str) -> Result<(), SinkClosed> {
        Ok(())
    }
}

/// Core trait for LLM providers
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Stream a chat completion into `sink` and return the full text.
    /// A `SinkClosed` from the sink ends generation with an error.
    async fn stream_chat(
        &self,
        messages: &[PromptMessage],
        config: &GenerationConfig,
        sink: &mut dyn TokenSink,
    ) -> Result<String>;

    /// Non-streamed completion.
    async fn complete(
        &self,
        messages: &[PromptMessage],
        config: &GenerationConfig,
    ) -> Result<String> {
        let mut sink = DiscardSink;
        self.stream_chat(messages, config, &mut sink).await
    }

    /// Get provider info
    fn info(&self) -> ProviderInfo;
}

/// Provider information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub endpoint: String,
    pub supports_streaming: bool,
}
