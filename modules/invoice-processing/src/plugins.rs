//! Contracts for the external collaborators the pipeline consumes.
//!
//! The concrete OCR engine, field extractor, summarizer, and blob store live
//! outside this module; the pipeline only sees these traits. The mock
//! implementations here are deterministic stand-ins for development and
//! tests.
//!
//! Every call site wraps these in a timeout (OCR and summarization 60s,
//! storage 10s); an elapsed timeout surfaces as a transient failure and goes
//! through the bus retry policy.

use crate::contracts::ExtractedFields;
use crate::error::{ProcessingError, ProcessingResult};
use crate::models::Invoice;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const OCR_TIMEOUT: Duration = Duration::from_secs(60);
pub const SUMMARIZE_TIMEOUT: Duration = Duration::from_secs(60);
pub const STORAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run an external call under its timeout; elapsed maps to a transient
/// failure so the bus retry policy applies.
pub async fn with_timeout<T, F>(
    timeout: Duration,
    context: &str,
    fut: F,
) -> ProcessingResult<T>
where
    F: Future<Output = ProcessingResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProcessingError::Transient(format!(
            "{context} timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

/// Result of running OCR over one document.
#[derive(Debug, Clone)]
pub struct OcrResult {
    pub full_text: String,
    /// Per-word confidences in reading order.
    pub word_confidences: Vec<f64>,
    pub overall_confidence: f64,
    pub page_count: u32,
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn ocr(&self, bytes: &[u8], language: &str) -> ProcessingResult<OcrResult>;
}

#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> ProcessingResult<ExtractedFields>;
}

/// Role-aware invoice summarization. Failure is non-fatal; callers fall
/// back to [`template_summary`].
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        invoice: &Invoice,
        role: &str,
        context: &str,
    ) -> ProcessingResult<String>;
}

/// Plain-template fallback used when the summarizer is unavailable.
pub fn template_summary(invoice: &Invoice) -> String {
    format!(
        "Invoice {} from {} for {} {}",
        invoice.invoice_number.as_deref().unwrap_or("(unnumbered)"),
        invoice.vendor_name.as_deref().unwrap_or("unknown vendor"),
        invoice.total_amount,
        invoice.currency,
    )
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store bytes under the key and return the storage path.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> ProcessingResult<String>;
    async fn get(&self, key: &str) -> ProcessingResult<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> ProcessingResult<bool>;
    async fn exists(&self, key: &str) -> ProcessingResult<bool>;
}

/// Storage key layout: `[tenant/]YYYY/MM/DD/<document_id>.<ext>`.
pub fn storage_key(tenant_id: &str, when: DateTime<Utc>, document_id: &str, ext: &str) -> String {
    let date = when.format("%Y/%m/%d");
    if tenant_id.is_empty() {
        format!("{date}/{document_id}.{ext}")
    } else {
        format!("{tenant_id}/{date}/{document_id}.{ext}")
    }
}

// ============================================================================
// MOCK IMPLEMENTATIONS
// ============================================================================

/// Mock OCR engine for development and testing.
///
/// Returns the document bytes interpreted as UTF-8 text (lossy) with a
/// configurable confidence. In production this is replaced by a real OCR
/// service integration.
pub struct MockOcrEngine {
    confidence: f64,
}

impl MockOcrEngine {
    pub fn new() -> Self {
        Self { confidence: 0.96 }
    }

    pub fn with_confidence(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl Default for MockOcrEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrEngine for MockOcrEngine {
    async fn ocr(&self, bytes: &[u8], _language: &str) -> ProcessingResult<OcrResult> {
        let full_text = String::from_utf8_lossy(bytes).into_owned();
        let words = full_text.split_whitespace().count();
        Ok(OcrResult {
            word_confidences: vec![self.confidence; words],
            full_text,
            overall_confidence: self.confidence,
            page_count: 1,
        })
    }
}

/// OCR engine that fails a configurable number of times before succeeding.
/// Used to exercise the retry and dead-letter paths.
pub struct FlakyOcrEngine {
    failures: AtomicU32,
    inner: MockOcrEngine,
}

impl FlakyOcrEngine {
    pub fn failing_times(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            inner: MockOcrEngine::new(),
        }
    }
}

#[async_trait]
impl OcrEngine for FlakyOcrEngine {
    async fn ocr(&self, bytes: &[u8], language: &str) -> ProcessingResult<OcrResult> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProcessingError::Transient(
                "ocr backend unavailable".to_string(),
            ));
        }
        self.inner.ocr(bytes, language).await
    }
}

/// Mock field extractor returning a pre-configured result.
pub struct MockFieldExtractor {
    result: Mutex<ExtractedFields>,
}

impl MockFieldExtractor {
    pub fn returning(result: ExtractedFields) -> Self {
        Self {
            result: Mutex::new(result),
        }
    }

    pub fn set_result(&self, result: ExtractedFields) {
        *self.result.lock().unwrap() = result;
    }
}

#[async_trait]
impl FieldExtractor for MockFieldExtractor {
    async fn extract(&self, _text: &str) -> ProcessingResult<ExtractedFields> {
        Ok(self.result.lock().unwrap().clone())
    }
}

/// Mock summarizer; emits the template summary with a role prefix.
pub struct MockSummarizer;

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(
        &self,
        invoice: &Invoice,
        role: &str,
        _context: &str,
    ) -> ProcessingResult<String> {
        Ok(format!("[{role}] {}", template_summary(invoice)))
    }
}

/// In-memory document store.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> ProcessingResult<String> {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.insert(key.to_string(), bytes);
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> ProcessingResult<Option<Vec<u8>>> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> ProcessingResult<bool> {
        let mut blobs = self.blobs.lock().unwrap();
        Ok(blobs.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> ProcessingResult<bool> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn storage_key_layout() {
        let when = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        assert_eq!(
            storage_key("t1", when, "doc-42", "pdf"),
            "t1/2026/08/01/doc-42.pdf"
        );
        assert_eq!(storage_key("", when, "doc-42", "png"), "2026/08/01/doc-42.png");
    }

    #[tokio::test]
    async fn timeout_maps_to_transient() {
        let result: ProcessingResult<()> = with_timeout(
            Duration::from_millis(10),
            "slow call",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(ProcessingError::Transient(_))));
    }

    #[tokio::test]
    async fn flaky_engine_recovers() {
        let engine = FlakyOcrEngine::failing_times(2);
        assert!(engine.ocr(b"text", "eng").await.is_err());
        assert!(engine.ocr(b"text", "eng").await.is_err());
        let result = engine.ocr(b"invoice text", "eng").await.unwrap();
        assert_eq!(result.full_text, "invoice text");
        assert_eq!(result.word_confidences.len(), 2);
    }

    #[tokio::test]
    async fn document_store_round_trip() {
        let store = InMemoryDocumentStore::new();
        let path = store.put("t1/2026/08/01/d.pdf", b"bytes".to_vec()).await.unwrap();
        assert_eq!(path, "t1/2026/08/01/d.pdf");
        assert!(store.exists(&path).await.unwrap());
        assert_eq!(store.get(&path).await.unwrap().unwrap(), b"bytes");
        assert!(store.delete(&path).await.unwrap());
        assert!(!store.exists(&path).await.unwrap());
    }
}
