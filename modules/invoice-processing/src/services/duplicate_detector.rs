//! Multi-strategy duplicate detection.
//!
//! Three independent strategies, checked in order of strength:
//!
//! 1. Exact content hash — the same file uploaded twice (confidence 1.0)
//! 2. Vendor + invoice number — the same invoice re-submitted (0.95)
//! 3. Similar amount from the same vendor within a short window (0.7)
//!
//! Missing or malformed candidate fields never fail a check; the affected
//! strategy simply contributes no match. All indices are per tenant.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Compute the hex SHA-256 of uploaded file bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateMatchType {
    ExactHash,
    VendorInvoiceNumber,
    SimilarAmount,
}

/// A potential duplicate of a prior invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateMatch {
    /// Id of the previously registered invoice.
    pub original_id: String,
    pub match_type: DuplicateMatchType,
    pub confidence: f64,
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// What the detector knows about the invoice being checked. Every field
/// except the content hash is optional; absent fields disable the
/// strategies that need them.
#[derive(Debug, Clone, Default)]
pub struct DuplicateCandidate {
    pub content_hash: String,
    pub vendor_name: Option<String>,
    pub vendor_id: Option<String>,
    pub invoice_number: Option<String>,
    pub amount: Option<Decimal>,
}

#[derive(Debug, Clone)]
struct IndexRecord {
    invoice_id: String,
    registered_at: DateTime<Utc>,
    amount: Option<Decimal>,
}

#[derive(Default)]
struct Indices {
    /// (tenant, content_hash) → registrations
    by_hash: HashMap<(String, String), Vec<IndexRecord>>,
    /// (tenant, vendor_key, invoice_number) → registrations
    by_vendor_number: HashMap<(String, String, String), Vec<IndexRecord>>,
    /// (tenant, lowercase vendor name) → recent registrations
    by_vendor_recent: HashMap<(String, String), Vec<IndexRecord>>,
}

/// Duplicate detector with per-tenant in-memory indices.
///
/// Index writes are serialized per upload by the orchestrator's per-invoice
/// lock; reads are advisory and may observe in-flight registrations.
pub struct DuplicateDetector {
    hash_window_days: i64,
    similar_window_days: i64,
    /// Maximum relative amount difference treated as "the same amount".
    amount_tolerance: Decimal,
    indices: Mutex<Indices>,
}

impl DuplicateDetector {
    pub fn new(hash_window_days: i64, similar_window_days: i64) -> Self {
        Self {
            hash_window_days,
            similar_window_days,
            amount_tolerance: Decimal::new(1, 2), // 1%
            indices: Mutex::new(Indices::default()),
        }
    }

    /// Register an invoice in every index its fields allow. Call after a
    /// successful upload.
    pub fn register(&self, invoice_id: &str, tenant_id: &str, candidate: &DuplicateCandidate) {
        self.register_at(invoice_id, tenant_id, candidate, Utc::now());
    }

    pub fn register_at(
        &self,
        invoice_id: &str,
        tenant_id: &str,
        candidate: &DuplicateCandidate,
        now: DateTime<Utc>,
    ) {
        let record = IndexRecord {
            invoice_id: invoice_id.to_string(),
            registered_at: now,
            amount: candidate.amount,
        };

        let mut indices = self.indices.lock().unwrap();

        if !candidate.content_hash.is_empty() {
            indices
                .by_hash
                .entry((tenant_id.to_string(), candidate.content_hash.clone()))
                .or_default()
                .push(record.clone());
        }

        if let (Some(vendor_key), Some(number)) =
            (vendor_key(candidate), candidate.invoice_number.as_deref())
        {
            if !number.is_empty() {
                indices
                    .by_vendor_number
                    .entry((
                        tenant_id.to_string(),
                        vendor_key,
                        number.to_string(),
                    ))
                    .or_default()
                    .push(record.clone());
            }
        }

        if let Some(name) = candidate.vendor_name.as_deref() {
            if !name.is_empty() {
                indices
                    .by_vendor_recent
                    .entry((tenant_id.to_string(), name.to_lowercase()))
                    .or_default()
                    .push(record);
            }
        }

        debug!(invoice_id, tenant_id, "Invoice registered for duplicate detection");
    }

    /// Run all strategies and return matches sorted by confidence descending.
    pub fn check_all(&self, tenant_id: &str, candidate: &DuplicateCandidate) -> Vec<DuplicateMatch> {
        self.check_all_at(tenant_id, candidate, Utc::now())
    }

    pub fn check_all_at(
        &self,
        tenant_id: &str,
        candidate: &DuplicateCandidate,
        now: DateTime<Utc>,
    ) -> Vec<DuplicateMatch> {
        let indices = self.indices.lock().unwrap();
        let mut matches = Vec::new();

        if let Some(m) = self.check_hash(&indices, tenant_id, candidate, now) {
            matches.push(m);
        }
        if let Some(m) = self.check_vendor_number(&indices, tenant_id, candidate) {
            matches.push(m);
        }
        if let Some(m) = self.check_similar_amount(&indices, tenant_id, candidate, now) {
            matches.push(m);
        }

        matches.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches
    }

    fn check_hash(
        &self,
        indices: &Indices,
        tenant_id: &str,
        candidate: &DuplicateCandidate,
        now: DateTime<Utc>,
    ) -> Option<DuplicateMatch> {
        if candidate.content_hash.is_empty() {
            return None;
        }
        let key = (tenant_id.to_string(), candidate.content_hash.clone());
        let cutoff = now - Duration::days(self.hash_window_days);
        let original = indices
            .by_hash
            .get(&key)?
            .iter()
            .find(|r| r.registered_at >= cutoff)?;

        let mut details = serde_json::Map::new();
        details.insert(
            "message".into(),
            serde_json::json!("exact duplicate file detected"),
        );
        details.insert(
            "original_upload_date".into(),
            serde_json::json!(original.registered_at.to_rfc3339()),
        );

        Some(DuplicateMatch {
            original_id: original.invoice_id.clone(),
            match_type: DuplicateMatchType::ExactHash,
            confidence: 1.0,
            details,
        })
    }

    fn check_vendor_number(
        &self,
        indices: &Indices,
        tenant_id: &str,
        candidate: &DuplicateCandidate,
    ) -> Option<DuplicateMatch> {
        let vendor_key = vendor_key(candidate)?;
        let number = candidate.invoice_number.as_deref().filter(|n| !n.is_empty())?;

        let key = (tenant_id.to_string(), vendor_key, number.to_string());
        let original = indices.by_vendor_number.get(&key)?.first()?;

        let mut details = serde_json::Map::new();
        details.insert(
            "message".into(),
            serde_json::json!("same invoice number from same vendor"),
        );
        details.insert(
            "invoice_number".into(),
            serde_json::json!(number),
        );
        if let Some(vendor) = candidate.vendor_name.as_deref() {
            details.insert("vendor".into(), serde_json::json!(vendor));
        }

        Some(DuplicateMatch {
            original_id: original.invoice_id.clone(),
            match_type: DuplicateMatchType::VendorInvoiceNumber,
            confidence: 0.95,
            details,
        })
    }

    fn check_similar_amount(
        &self,
        indices: &Indices,
        tenant_id: &str,
        candidate: &DuplicateCandidate,
        now: DateTime<Utc>,
    ) -> Option<DuplicateMatch> {
        let vendor = candidate
            .vendor_name
            .as_deref()
            .filter(|v| !v.is_empty())?;
        let amount = candidate.amount.filter(|a| *a > Decimal::ZERO)?;

        let key = (tenant_id.to_string(), vendor.to_lowercase());
        let cutoff = now - Duration::days(self.similar_window_days);

        let original = indices.by_vendor_recent.get(&key)?.iter().find(|record| {
            if record.registered_at < cutoff {
                return false;
            }
            let Some(prior) = record.amount.filter(|a| *a > Decimal::ZERO) else {
                return false;
            };
            let diff_ratio = (amount - prior).abs() / amount.max(prior);
            diff_ratio <= self.amount_tolerance
        })?;

        let mut details = serde_json::Map::new();
        details.insert(
            "message".into(),
            serde_json::json!(format!(
                "similar invoice from same vendor within {} days",
                self.similar_window_days
            )),
        );
        details.insert("vendor".into(), serde_json::json!(vendor));
        details.insert("amount".into(), serde_json::json!(amount.to_string()));
        if let Some(prior) = original.amount {
            details.insert(
                "original_amount".into(),
                serde_json::json!(prior.to_string()),
            );
        }

        Some(DuplicateMatch {
            original_id: original.invoice_id.clone(),
            match_type: DuplicateMatchType::SimilarAmount,
            confidence: 0.7,
            details,
        })
    }
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(90, 7)
    }
}

/// Prefer the stable vendor id; fall back to the extracted name.
fn vendor_key(candidate: &DuplicateCandidate) -> Option<String> {
    candidate
        .vendor_id
        .as_deref()
        .or(candidate.vendor_name.as_deref())
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}
