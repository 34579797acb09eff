//! External collaborator contracts: the document converter,
//! audio transcriber, and page extractor are out of scope to
//! implement — this module only states the interfaces the task
//! handlers consume, plus deterministic in-memory fakes for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::CollaboratorError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionMetadata {
    pub pages: Option<i32>,
    pub words: Option<i64>,
    pub format: String,
    pub size_bytes: i64,
    pub title: Option<String>,
    pub author: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    pub markdown: String,
    pub metadata: ConversionMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct ConversionOptions {
    pub docling_preset: String,
}

/// `convert(path, options) -> {markdown, metadata}`.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(
        &self,
        path: &Path,
        options: &ConversionOptions,
    ) -> Result<ConversionResult, CollaboratorError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub segments: Vec<TranscriptSegment>,
    pub language: String,
    pub duration: f64,
    pub word_count: i64,
    pub char_count: i64,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Default)]
pub struct TranscriptionOptions {
    pub language: Option<String>,
    pub include_word_timestamps: bool,
}

/// `transcribe(path, options)` plus `format_as_markdown`.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        path: &Path,
        options: &TranscriptionOptions,
    ) -> Result<TranscriptionResult, CollaboratorError>;

    fn format_as_markdown(&self, result: &TranscriptionResult, include_timestamps: bool) -> String {
        let mut out = String::new();
        for segment in &result.segments {
            if include_timestamps {
                out.push_str(&format!("[{:.1}s - {:.1}s] ", segment.start, segment.end));
            }
            out.push_str(&segment.text);
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct ExtractedPage {
    pub page_number: i32,
    pub local_path: std::path::PathBuf,
    pub blob_key: String,
}

/// `split`, `extract_one`, `count_pages`, `should_split`.
#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn split(
        &self,
        pdf_path: &Path,
        main_id: uuid::Uuid,
    ) -> Result<Vec<ExtractedPage>, CollaboratorError>;

    async fn extract_one(
        &self,
        pdf_path: &Path,
        page_number: i32,
        main_id: uuid::Uuid,
    ) -> Result<ExtractedPage, CollaboratorError>;

    async fn count_pages(&self, pdf_path: &Path) -> Result<i32, CollaboratorError>;

    async fn should_split(&self, pdf_path: &Path, min_pages: i32) -> Result<bool, CollaboratorError> {
        Ok(self.count_pages(pdf_path).await? >= min_pages)
    }
}

/// Deterministic fake converter for tests: echoes the input bytes'
/// length as the markdown body.
pub struct FakeDocumentConverter;

#[async_trait]
impl DocumentConverter for FakeDocumentConverter {
    async fn convert(
        &self,
        path: &Path,
        _options: &ConversionOptions,
    ) -> Result<ConversionResult, CollaboratorError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| CollaboratorError::ConversionFailed(e.to_string()))?;
        let markdown = format!("# Converted\n\n{} bytes of source material.\n", bytes.len());
        Ok(ConversionResult {
            markdown,
            metadata: ConversionMetadata {
                pages: Some(1),
                words: Some(4),
                format: "markdown".to_string(),
                size_bytes: bytes.len() as i64,
                title: None,
                author: None,
            },
        })
    }
}

/// Deterministic fake transcriber for tests.
pub struct FakeTranscriber;

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(
        &self,
        path: &Path,
        options: &TranscriptionOptions,
    ) -> Result<TranscriptionResult, CollaboratorError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| CollaboratorError::TranscriptionFailed(e.to_string()))?;
        let text = format!("transcribed {} bytes of audio", bytes.len());
        Ok(TranscriptionResult {
            segments: vec![TranscriptSegment { start: 0.0, end: 1.0, text: text.clone() }],
            language: options.language.clone().unwrap_or_else(|| "en".to_string()),
            duration: 1.0,
            word_count: text.split_whitespace().count() as i64,
            char_count: text.len() as i64,
            provider: "fake".to_string(),
            model: "fake-v1".to_string(),
        })
    }
}

/// Deterministic fake page extractor for tests: splits on a
/// fixed-size chunk boundary instead of real PDF page parsing.
pub struct FakePageExtractor {
    pub chunk_bytes: usize,
}

impl Default for FakePageExtractor {
    fn default() -> Self {
        Self { chunk_bytes: 64 }
    }
}

#[async_trait]
impl PageExtractor for FakePageExtractor {
    async fn split(
        &self,
        pdf_path: &Path,
        main_id: uuid::Uuid,
    ) -> Result<Vec<ExtractedPage>, CollaboratorError> {
        let bytes = tokio::fs::read(pdf_path)
            .await
            .map_err(|e| CollaboratorError::SplitFailed(e.to_string()))?;
        let n = self.count_pages(pdf_path).await?;
        let mut pages = Vec::with_capacity(n as usize);
        for page_number in 1..=n {
            pages.push(ExtractedPage {
                page_number,
                local_path: pdf_path.to_path_buf(),
                blob_key: crate::blob::page_key(main_id, page_number),
            });
        }
        let _ = bytes;
        Ok(pages)
    }

    async fn extract_one(
        &self,
        pdf_path: &Path,
        page_number: i32,
        main_id: uuid::Uuid,
    ) -> Result<ExtractedPage, CollaboratorError> {
        Ok(ExtractedPage {
            page_number,
            local_path: pdf_path.to_path_buf(),
            blob_key: crate::blob::page_key(main_id, page_number),
        })
    }

    async fn count_pages(&self, pdf_path: &Path) -> Result<i32, CollaboratorError> {
        let bytes = tokio::fs::read(pdf_path)
            .await
            .map_err(|e| CollaboratorError::SplitFailed(e.to_string()))?;
        let pages = (bytes.len() / self.chunk_bytes).max(1);
        Ok(pages as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_converter_reports_input_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.pdf");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let converter = FakeDocumentConverter;
        let result = converter
            .convert(&path, &ConversionOptions::default())
            .await
            .unwrap();
        assert_eq!(result.metadata.size_bytes, 11);
    }

    #[tokio::test]
    async fn fake_extractor_splits_by_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.pdf");
        tokio::fs::write(&path, vec![0u8; 130]).await.unwrap();

        let extractor = FakePageExtractor { chunk_bytes: 64 };
        let pages = extractor.split(&path, uuid::Uuid::new_v4()).await.unwrap();
        assert_eq!(pages.len(), 2);
    }

    #[test]
    fn format_as_markdown_includes_timestamps_when_requested() {
        let transcriber = FakeTranscriber;
        let result = TranscriptionResult {
            segments: vec![TranscriptSegment { start: 0.0, end: 2.5, text: "hi".to_string() }],
            language: "en".to_string(),
            duration: 2.5,
            word_count: 1,
            char_count: 2,
            provider: "fake".to_string(),
            model: "fake-v1".to_string(),
        };
        let with_ts = transcriber.format_as_markdown(&result, true);
        assert!(with_ts.contains("0.0s"));
        let without_ts = transcriber.format_as_markdown(&result, false);
        assert!(!without_ts.contains('['));
    }
}
