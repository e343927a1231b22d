use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;

/// Layout/OCR capability used for PDF and image uploads.
#[async_trait]
pub trait DocumentAnalyzer: Send + Sync {
    /// Analyze raw bytes of the declared content type and return the
    /// structural paragraphs in reading order.
    async fn analyze(&self, bytes: &[u8], content_type: &str) -> Result<Vec<String>>;
}

/// Local analyzer backed by `pdf-extract`. Paragraphs are blank-line separated
/// blocks of the extracted text. Images need an OCR backend and are rejected.
#[derive(Debug, Default, Clone)]
pub struct PdfTextAnalyzer;

impl PdfTextAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DocumentAnalyzer for PdfTextAnalyzer {
    async fn analyze(&self, bytes: &[u8], content_type: &str) -> Result<Vec<String>> {
        if content_type != "application/pdf" {
            return Err(anyhow!(
                "Local analyzer cannot OCR '{}' content; configure a document analysis endpoint",
                content_type
            ));
        }

        let owned = bytes.to_vec();
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&owned))
            .await
            .context("PDF extraction task panicked")?
            .map_err(|e| anyhow!("PDF parse error: {}", e))?;

        Ok(text_to_paragraphs(&text))
    }
}

/// Group lines into paragraphs on blank lines, joining wrapped lines with a space.
pub fn text_to_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join(" "));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join(" "));
    }

    paragraphs
}
