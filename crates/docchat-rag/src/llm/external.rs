//! External chat-completion providers: OpenAI-compatible endpoints and Azure OpenAI

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

use super::{GenerationConfig, LLMProvider, PromptMessage, ProviderInfo, TokenSink};
use crate::config::{LlmConfig, LlmFlavor};

/// External API provider
pub struct ExternalProvider {
    flavor: LlmFlavor,
    api_key: String,
    client: Client,
}

impl ExternalProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            flavor: config.flavor.clone(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn endpoint(&self, model: &str) -> String {
        match &self.flavor {
            LlmFlavor::OpenAi { base_url } => {
                format!("{}/chat/completions", base_url.trim_end_matches('/'))
            }
            LlmFlavor::AzureOpenAi {
                instance,
                api_version,
            } => format!(
                "https://{}.openai.azure.com/openai/deployments/{}/chat/completions?api-version={}",
                instance,
                azure_deployment_name(model),
                api_version
            ),
        }
    }

    fn request_body(&self, messages: &[PromptMessage], config: &GenerationConfig) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "messages": messages,
            "temperature": config.temperature,
            "stream": true,
        });
        // Azure selects the model through the deployment in the URL
        if matches!(self.flavor, LlmFlavor::OpenAi { .. }) {
            body["model"] = json!(config.model);
        }
        if let Some(max_tokens) = config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.flavor {
            LlmFlavor::OpenAi { .. } => {
                request.header("Authorization", format!("Bearer {}", self.api_key))
            }
            LlmFlavor::AzureOpenAi { .. } => request.header("api-key", &self.api_key),
        }
    }
}

/// Azure deployment names cannot contain dots: `gpt-3.5-turbo` is served as `gpt-35-turbo`.
pub fn azure_deployment_name(model: &str) -> String {
    model.replace('.', "")
}

#[async_trait]
impl LLMProvider for ExternalProvider {
    async fn stream_chat(
        &self,
        messages: &[PromptMessage],
        config: &GenerationConfig,
        sink: &mut dyn TokenSink,
    ) -> Result<String> {
        let endpoint = self.endpoint(&config.model);
        let request = self
            .authorize(self.client.post(&endpoint))
            .header("Content-Type", "application/json")
            .json(&self.request_body(messages, config));

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow!("Request to {} timed out", endpoint)
            } else if e.is_connect() {
                anyhow!("Failed to connect to {}: {}", endpoint, e)
            } else {
                anyhow!("Request to {} failed: {}", endpoint, e)
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(300).collect();
            return Err(anyhow!("API error ({}): {}", status, preview));
        }

        let mut decoder = SseDecoder::default();
        let mut full = String::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Chat completion stream interrupted")?;
            for event in decoder.push(&chunk) {
                match event {
                    SseEvent::Done => return Ok(full),
                    SseEvent::Delta(content) => {
                        full.push_str(&content);
                        sink.send_token(&content).await.map_err(anyhow::Error::new)?;
                    }
                }
            }
        }

        tracing::debug!(chars = full.len(), "Chat completion stream ended without [DONE]");
        Ok(full)
    }

    fn info(&self) -> ProviderInfo {
        let name = match self.flavor {
            LlmFlavor::OpenAi { .. } => "openai",
            LlmFlavor::AzureOpenAi { .. } => "azure-openai",
        };
        ProviderInfo {
            name: name.to_string(),
            endpoint: self.endpoint("{model}"),
            supports_streaming: true,
        }
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Done,
}

/// Incremental `data:` line decoder; network chunks may split lines anywhere.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim_end().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
                continue;
            }
            let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) else {
                continue;
            };
            // Azure sends a leading content-filter event with an empty choices array
            if let Some(content) = parsed["choices"][0]["delta"]["content"].as_str() {
                if !content.is_empty() {
                    events.push(SseEvent::Delta(content.to_string()));
                }
            }
        }
        events
    }
}
