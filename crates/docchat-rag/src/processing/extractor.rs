use anyhow::anyhow;
use std::sync::Arc;

use super::analysis::DocumentAnalyzer;
use super::mail::MailMessage;
use super::parser::{decode_text, parse_docx, split_paragraphs};
use crate::error::UploadError;
use crate::types::SourceDocument;

const DOCUMENT_ANALYSIS_TYPES: &[&str] = &["application/pdf", "image/jpeg", "image/png"];
const WORD_PROCESSING_TYPES: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/msword",
];
const PLAIN_TEXT_TYPES: &[&str] = &["text/plain"];
// Browsers often report .msg attachments as octet-stream
const MAIL_MESSAGE_TYPES: &[&str] = &[
    "application/vnd.ms-outlook",
    "application/octet-stream",
    "message/rfc822",
];

/// How an upload's bytes are turned into paragraphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    DocumentAnalysis,
    WordProcessing,
    PlainText,
    MailMessage,
    Unsupported,
}

impl ExtractionStrategy {
    pub fn from_mime_type(mime_type: &str) -> Self {
        // Parameters such as "; charset=utf-8" do not affect dispatch
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let essence = essence.as_str();

        if DOCUMENT_ANALYSIS_TYPES.contains(&essence) {
            Self::DocumentAnalysis
        } else if WORD_PROCESSING_TYPES.contains(&essence) {
            Self::WordProcessing
        } else if PLAIN_TEXT_TYPES.contains(&essence) {
            Self::PlainText
        } else if MAIL_MESSAGE_TYPES.contains(&essence) {
            Self::MailMessage
        } else {
            Self::Unsupported
        }
    }
}

/// An uploaded blob as handed over by the transport layer.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

pub struct ContentExtractor {
    analyzer: Arc<dyn DocumentAnalyzer>,
    max_document_size: u64,
}

impl ContentExtractor {
    pub fn new(analyzer: Arc<dyn DocumentAnalyzer>, max_document_size: u64) -> Self {
        Self {
            analyzer,
            max_document_size,
        }
    }

    /// Checks that run before any backend is touched.
    pub fn validate<'a>(
        &self,
        file: Option<&'a UploadedFile>,
    ) -> Result<(&'a UploadedFile, ExtractionStrategy), UploadError> {
        let file = file.ok_or(UploadError::MissingFile)?;

        if file.size() > self.max_document_size {
            return Err(UploadError::FileTooLarge {
                size: file.size(),
                limit: self.max_document_size,
            });
        }

        match ExtractionStrategy::from_mime_type(&file.mime_type) {
            ExtractionStrategy::Unsupported => Err(UploadError::InvalidFileType {
                mime_type: file.mime_type.clone(),
            }),
            strategy => Ok((file, strategy)),
        }
    }

    /// Extract one `SourceDocument` per paragraph, in document order.
    pub async fn extract(
        &self,
        file: Option<&UploadedFile>,
    ) -> Result<Vec<SourceDocument>, UploadError> {
        let (file, strategy) = self.validate(file)?;

        let paragraphs = self.run_strategy(strategy, file).await.map_err(|cause| {
            tracing::error!(
                file_name = %file.name,
                mime_type = %file.mime_type,
                error = ?cause,
                "Content extraction failed"
            );
            UploadError::Extraction { cause }
        })?;

        if paragraphs.is_empty() {
            tracing::warn!(file_name = %file.name, "No extractable text");
            return Err(UploadError::NoExtractableText);
        }

        tracing::info!(
            file_name = %file.name,
            strategy = ?strategy,
            paragraphs = paragraphs.len(),
            "Extracted document"
        );

        Ok(paragraphs
            .into_iter()
            .map(|page_content| SourceDocument {
                page_content,
                file_name: file.name.clone(),
            })
            .collect())
    }

    async fn run_strategy(
        &self,
        strategy: ExtractionStrategy,
        file: &UploadedFile,
    ) -> anyhow::Result<Vec<String>> {
        match strategy {
            ExtractionStrategy::DocumentAnalysis => {
                let paragraphs = self.analyzer.analyze(&file.bytes, &file.mime_type).await?;
                Ok(paragraphs
                    .into_iter()
                    .filter(|p| !p.trim().is_empty())
                    .collect())
            }
            ExtractionStrategy::WordProcessing => {
                let bytes = file.bytes.clone();
                let text = tokio::task::spawn_blocking(move || parse_docx(&bytes)).await??;
                Ok(split_paragraphs(&text))
            }
            ExtractionStrategy::PlainText => Ok(split_paragraphs(&decode_text(&file.bytes))),
            ExtractionStrategy::MailMessage => {
                Ok(MailMessage::parse(&file.bytes)?.to_paragraphs())
            }
            ExtractionStrategy::Unsupported => Err(anyhow!(
                "No extraction strategy for '{}'",
                file.mime_type
            )),
        }
    }
}
