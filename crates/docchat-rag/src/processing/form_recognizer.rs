//! HTTP client for a Form-Recognizer style document analysis service:
//! submit bytes, follow `Operation-Location`, poll until the layout is ready.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::analysis::DocumentAnalyzer;
use crate::config::DocumentAnalysisConfig;

pub struct FormRecognizerClient {
    config: DocumentAnalysisConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeOperation {
    status: String,
    analyze_result: Option<AnalyzeResult>,
    error: Option<ServiceError>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResult {
    #[serde(default)]
    paragraphs: Vec<Paragraph>,
}

#[derive(Debug, Deserialize)]
struct Paragraph {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    code: Option<String>,
    message: Option<String>,
}

enum PollState {
    Running,
    Done(Vec<String>),
}

impl FormRecognizerClient {
    pub fn new(config: DocumentAnalysisConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self { config, client })
    }

    fn analyze_url(&self) -> String {
        format!(
            "{}/formrecognizer/documentModels/{}:analyze?api-version={}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model_id,
            self.config.api_version
        )
    }

    async fn poll(&self, operation_url: &str) -> Result<Vec<String>> {
        for attempt in 0..self.config.max_polls {
            let response = self
                .client
                .get(operation_url)
                .header("Ocp-Apim-Subscription-Key", &self.config.api_key)
                .send()
                .await
                .context("Document analysis poll request failed")?;

            if !response.status().is_success() {
                return Err(anyhow!(
                    "Document analysis poll returned HTTP {}",
                    response.status()
                ));
            }

            let operation: AnalyzeOperation = response
                .json()
                .await
                .context("Failed to parse document analysis operation")?;

            match interpret_operation(operation)? {
                PollState::Done(paragraphs) => {
                    tracing::debug!(attempt, paragraphs = paragraphs.len(), "Document analysis finished");
                    return Ok(paragraphs);
                }
                PollState::Running => {
                    tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
                }
            }
        }

        Err(anyhow!(
            "Document analysis did not finish after {} polls",
            self.config.max_polls
        ))
    }
}

fn interpret_operation(operation: AnalyzeOperation) -> Result<PollState> {
    match operation.status.as_str() {
        "succeeded" => Ok(PollState::Done(
            operation
                .analyze_result
                .map(|r| r.paragraphs.into_iter().map(|p| p.content).collect())
                .unwrap_or_default(),
        )),
        "failed" => {
            let (code, message) = operation
                .error
                .map(|e| (e.code.unwrap_or_default(), e.message.unwrap_or_default()))
                .unwrap_or_default();
            Err(anyhow!("Document analysis failed: {} {}", code, message))
        }
        _ => Ok(PollState::Running),
    }
}

#[async_trait]
impl DocumentAnalyzer for FormRecognizerClient {
    async fn analyze(&self, bytes: &[u8], content_type: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .post(self.analyze_url())
            .header("Ocp-Apim-Subscription-Key", &self.config.api_key)
            .header("Content-Type", content_type)
            .body(Bytes::copy_from_slice(bytes))
            .send()
            .await
            .context("Document analysis request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(300).collect();
            return Err(anyhow!("Document analysis returned HTTP {}: {}", status, preview));
        }

        let operation_url = response
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Document analysis response has no Operation-Location header"))?;

        self.poll(&operation_url).await
    }
}
