use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::config::Settings;

/// Inserted between the text of consecutive PDF pages.
pub(crate) const PAGE_SEPARATOR: &str = "\n\n--- Nueva Página ---\n\n";

const FEATURE_TYPE: &str = "DOCUMENT_TEXT_DETECTION";
/// The file annotation endpoint accepts at most five pages per request.
const PDF_PAGE_WINDOW: u32 = 5;

#[derive(Debug, Error)]
pub(crate) enum OcrError {
    #[error("unsupported document format")]
    Unsupported,
    #[error("no text detected in document")]
    Empty,
    #[error("ocr service error: {0}")]
    Service(String),
    #[error("failed to read document: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DocumentFormat {
    Jpeg,
    Png,
    Pdf,
}

impl DocumentFormat {
    pub(crate) fn detect(bytes: &[u8], extension: Option<&str>) -> Option<Self> {
        if bytes.starts_with(b"%PDF") {
            return Some(Self::Pdf);
        }
        if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
            return Some(Self::Png);
        }
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Self::Jpeg);
        }

        match extension.map(|ext| ext.to_ascii_lowercase()).as_deref() {
            Some("pdf") => Some(Self::Pdf),
            Some("png") => Some(Self::Png),
            Some("jpg" | "jpeg") => Some(Self::Jpeg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ExtractedText {
    pub(crate) text: String,
    pub(crate) page_count: u32,
}

#[async_trait]
pub(crate) trait TextExtractor: Send + Sync {
    async fn extract_text(&self, path: &Path) -> Result<ExtractedText, OcrError>;
}

#[derive(Debug, Clone)]
pub(crate) struct VisionOcrService {
    client: Client,
    api_key: String,
    base_url: String,
    max_pdf_pages: u32,
}

impl VisionOcrService {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(Duration::from_secs(settings.ocr().timeout_seconds))
            .build()
            .context("Failed to build Vision HTTP client")?;

        Ok(Self {
            client,
            api_key: settings.ocr().api_key.clone(),
            base_url: settings.ocr().base_url.trim_end_matches('/').to_string(),
            max_pdf_pages: settings.ocr().max_pdf_pages,
        })
    }

    async fn annotate_image(&self, bytes: &[u8]) -> Result<String, OcrError> {
        let payload = json!({
            "requests": [{
                "image": {"content": general_purpose::STANDARD.encode(bytes)},
                "features": [{"type": FEATURE_TYPE}]
            }]
        });

        let body = self.post("images:annotate", &payload).await?;
        let response = body
            .get("responses")
            .and_then(|items| items.get(0))
            .ok_or_else(|| OcrError::Service("empty annotate response".to_string()))?;

        if let Some(message) = response_error(response) {
            return Err(OcrError::Service(message));
        }

        Ok(full_text(response).unwrap_or_default())
    }

    async fn annotate_pdf(&self, bytes: &[u8]) -> Result<(String, u32), OcrError> {
        let content = general_purpose::STANDARD.encode(bytes);
        let mut pages: Vec<String> = Vec::new();
        let mut total_pages: Option<u32> = None;
        let mut first_page = 1_u32;

        loop {
            let last_allowed = total_pages.unwrap_or(u32::MAX).min(self.max_pdf_pages);
            if first_page > last_allowed {
                break;
            }
            let last_page = (first_page + PDF_PAGE_WINDOW - 1).min(last_allowed);
            let window: Vec<u32> = (first_page..=last_page).collect();

            let payload = json!({
                "requests": [{
                    "inputConfig": {"content": content, "mimeType": "application/pdf"},
                    "features": [{"type": FEATURE_TYPE}],
                    "pages": window
                }]
            });

            let body = self.post("files:annotate", &payload).await?;
            let file_response = body
                .get("responses")
                .and_then(|items| items.get(0))
                .ok_or_else(|| OcrError::Service("empty file annotate response".to_string()))?;

            if let Some(message) = response_error(file_response) {
                return Err(OcrError::Service(message));
            }

            let reported = file_response
                .get("totalPages")
                .and_then(Value::as_u64)
                .and_then(|value| u32::try_from(value).ok());
            if total_pages.is_none() {
                total_pages = Some(reported.unwrap_or(last_page));
            }

            let page_responses = file_response
                .get("responses")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for (offset, page) in page_responses.iter().enumerate() {
                let page_number = page
                    .get("context")
                    .and_then(|context| context.get("pageNumber"))
                    .and_then(Value::as_u64)
                    .unwrap_or(u64::from(first_page) + offset as u64);

                if let Some(message) = response_error(page) {
                    tracing::warn!(page = page_number, error = %message, "OCR failed for PDF page");
                    continue;
                }
                match full_text(page) {
                    Some(text) if !text.trim().is_empty() => pages.push(text),
                    _ => tracing::debug!(page = page_number, "No text detected on PDF page"),
                }
            }

            first_page = last_page + 1;
        }

        let page_count = total_pages.unwrap_or(0).min(self.max_pdf_pages);
        if total_pages.is_some_and(|total| total > self.max_pdf_pages) {
            tracing::warn!(
                total_pages = total_pages.unwrap_or_default(),
                max_pdf_pages = self.max_pdf_pages,
                "PDF truncated to page limit"
            );
        }

        Ok((pages.join(PAGE_SEPARATOR), page_count))
    }

    async fn post(&self, method: &str, payload: &Value) -> Result<Value, OcrError> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|err| OcrError::Service(format!("request to {method} failed: {err}")))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            return Err(OcrError::Service(format!("{method} returned {status}: {message}")));
        }

        Ok(body)
    }
}

#[async_trait]
impl TextExtractor for VisionOcrService {
    async fn extract_text(&self, path: &Path) -> Result<ExtractedText, OcrError> {
        let bytes = tokio::fs::read(path).await?;
        let extension = path.extension().and_then(|ext| ext.to_str());
        let format = DocumentFormat::detect(&bytes, extension).ok_or(OcrError::Unsupported)?;

        let (text, page_count) = match format {
            DocumentFormat::Pdf => self.annotate_pdf(&bytes).await?,
            DocumentFormat::Jpeg | DocumentFormat::Png => (self.annotate_image(&bytes).await?, 1),
        };

        if text.trim().is_empty() {
            return Err(OcrError::Empty);
        }

        tracing::debug!(?format, page_count, text_length = text.len(), "OCR extraction finished");
        Ok(ExtractedText { text, page_count })
    }
}

fn full_text(response: &Value) -> Option<String> {
    response
        .get("fullTextAnnotation")
        .and_then(|annotation| annotation.get("text"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn response_error(response: &Value) -> Option<String> {
    response
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .filter(|message| !message.is_empty())
        .map(ToString::to_string)
}
