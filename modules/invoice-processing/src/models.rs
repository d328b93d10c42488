//! Domain models for the invoice pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// INVOICE
// ============================================================================

/// Invoice lifecycle states. Transitions between them are owned exclusively
/// by the workflow state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceState {
    Uploaded,
    Processing,
    OcrComplete,
    Extracted,
    Validated,
    ReviewPending,
    Approved,
    Rejected,
    PaymentPending,
    Paid,
    Archived,
    Error,
}

impl fmt::Display for InvoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uploaded => "uploaded",
            Self::Processing => "processing",
            Self::OcrComplete => "ocr_complete",
            Self::Extracted => "extracted",
            Self::Validated => "validated",
            Self::ReviewPending => "review_pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::PaymentPending => "payment_pending",
            Self::Paid => "paid",
            Self::Archived => "archived",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One invoice line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_rate: Option<Decimal>,
}

/// The central entity of the pipeline.
///
/// The identifier is immutable; `state` changes only through the workflow
/// state machine; `content_hash` is set at upload and uniquely identifies
/// the source bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub document_id: String,
    pub tenant_id: String,
    pub state: InvoiceState,

    pub vendor_id: Option<String>,
    pub vendor_name: Option<String>,
    pub vendor_address: Option<String>,

    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,

    pub currency: String,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub line_items: Vec<LineItem>,

    pub po_number: Option<String>,
    pub payment_terms: Option<String>,

    /// Composite risk score in [0, 1].
    pub risk_score: f64,
    pub risk_level: Option<RiskLevel>,
    /// Ordered anomaly tags accumulated across pipeline stages.
    pub anomalies: Vec<String>,
    pub extraction_confidence: f64,
    pub requires_review: bool,

    /// SHA-256 of the source bytes, 64 hex chars.
    pub content_hash: String,
    pub source_filename: String,
    pub source_size: u64,
    pub storage_path: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
}

impl Invoice {
    /// Check that total = subtotal + tax within a one-cent rounding
    /// tolerance. Only meaningful once amounts have been extracted.
    pub fn totals_consistent(&self) -> bool {
        let expected = self.subtotal + self.tax_amount;
        (self.total_amount - expected).abs() <= Decimal::new(1, 2)
    }
}

/// Risk classification levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

// ============================================================================
// VENDOR
// ============================================================================

/// Vendor risk bands kept on the profile, distinct from the per-invoice
/// composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorRiskLevel {
    Low,
    Normal,
    High,
    Critical,
}

/// Statistical profile of a vendor, recomputed on every ingest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VendorStatistics {
    pub total_invoices: u64,
    pub total_amount: Decimal,
    pub average_amount: Decimal,
    pub std_deviation: f64,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub first_invoice_date: Option<DateTime<Utc>>,
    pub last_invoice_date: Option<DateTime<Utc>>,
    pub invoice_frequency_days: f64,
}

/// Vendor profile. Mutated only through the ingest-time update path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorProfile {
    pub vendor_id: String,
    pub vendor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_id: Option<String>,
    pub payment_terms_history: Vec<String>,
    pub currency: String,
    pub risk_level: VendorRiskLevel,
    pub statistics: VendorStatistics,
    pub is_verified: bool,
}

impl VendorProfile {
    pub fn new(vendor_id: &str, vendor_name: &str, currency: &str) -> Self {
        Self {
            vendor_id: vendor_id.to_string(),
            vendor_name: vendor_name.to_string(),
            tax_id: None,
            payment_terms_history: Vec::new(),
            currency: currency.to_string(),
            risk_level: VendorRiskLevel::Normal,
            statistics: VendorStatistics::default(),
            is_verified: false,
        }
    }
}

// ============================================================================
// APPROVAL TASK
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Approved,
    Rejected,
    Escalated,
    Expired,
}

impl TaskStatus {
    /// Approved, rejected, and expired tasks never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Expired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Normal,
    High,
    Urgent,
}

/// A pending (or decided) approval for one invoice.
///
/// At most one task per invoice is `pending` at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTask {
    pub id: String,
    pub invoice_id: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub required_approvers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_role: Option<String>,
    pub due_date: DateTime<Utc>,
    pub sla_status: SlaStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_taken: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegated_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Decision carried on `approval.completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    Escalated,
    Delegated,
}

// ============================================================================
// SLA
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaStatus {
    OnTrack,
    Warning,
    Breached,
    Expired,
}

/// Escalation rungs, strictly ordered; a record's level never goes back down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    None,
    Reminder,
    Manager,
    Director,
    Executive,
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Reminder => "reminder",
            Self::Manager => "manager",
            Self::Director => "director",
            Self::Executive => "executive",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&InvoiceState::ReviewPending).unwrap(),
            "\"review_pending\""
        );
        assert_eq!(
            serde_json::from_str::<InvoiceState>("\"ocr_complete\"").unwrap(),
            InvoiceState::OcrComplete
        );
    }

    #[test]
    fn terminal_task_statuses() {
        assert!(TaskStatus::Approved.is_terminal());
        assert!(TaskStatus::Rejected.is_terminal());
        assert!(TaskStatus::Expired.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Escalated.is_terminal());
    }

    #[test]
    fn escalation_levels_are_ordered() {
        assert!(EscalationLevel::None < EscalationLevel::Reminder);
        assert!(EscalationLevel::Reminder < EscalationLevel::Manager);
        assert!(EscalationLevel::Manager < EscalationLevel::Director);
        assert!(EscalationLevel::Director < EscalationLevel::Executive);
    }

    #[test]
    fn totals_consistency_allows_rounding() {
        let mut invoice = sample_invoice();
        invoice.subtotal = Decimal::new(10000, 2); // 100.00
        invoice.tax_amount = Decimal::new(825, 2); // 8.25
        invoice.total_amount = Decimal::new(10825, 2);
        assert!(invoice.totals_consistent());

        invoice.total_amount = Decimal::new(10826, 2); // off by a cent
        assert!(invoice.totals_consistent());

        invoice.total_amount = Decimal::new(10925, 2); // off by a dollar
        assert!(!invoice.totals_consistent());
    }

    pub(crate) fn sample_invoice() -> Invoice {
        Invoice {
            id: "inv-1".into(),
            document_id: "doc-1".into(),
            tenant_id: "t1".into(),
            state: InvoiceState::Uploaded,
            vendor_id: None,
            vendor_name: None,
            vendor_address: None,
            invoice_number: None,
            invoice_date: None,
            due_date: None,
            currency: "USD".into(),
            subtotal: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
            total_amount: Decimal::ZERO,
            line_items: Vec::new(),
            po_number: None,
            payment_terms: None,
            risk_score: 0.0,
            risk_level: None,
            anomalies: Vec::new(),
            extraction_confidence: 0.0,
            requires_review: false,
            content_hash: String::new(),
            source_filename: "scan.pdf".into(),
            source_size: 2048,
            storage_path: "t1/2026/08/01/doc-1.pdf".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            created_by: "system".into(),
        }
    }
}
