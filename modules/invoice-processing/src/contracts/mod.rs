//! Versioned event payload contracts.
//!
//! Every struct here is the `data` object of one bus event type. Producers
//! and consumers share these definitions so the wire shape can only change
//! by introducing a new version.

use crate::error::{ProcessingError, ProcessingResult};
use crate::models::{ApprovalDecision, LineItem};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Serialize a payload into a bus message's `data` object.
pub fn encode<T: Serialize>(payload: &T) -> ProcessingResult<serde_json::Map<String, serde_json::Value>> {
    match serde_json::to_value(payload) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(ProcessingError::InvalidInput(
            "payload must serialize to an object".to_string(),
        )),
        Err(e) => Err(ProcessingError::InvalidInput(format!(
            "failed to serialize payload: {e}"
        ))),
    }
}

/// Parse a bus message's `data` object into a typed payload.
pub fn decode<T: DeserializeOwned>(
    data: &serde_json::Map<String, serde_json::Value>,
) -> ProcessingResult<T> {
    serde_json::from_value(serde_json::Value::Object(data.clone()))
        .map_err(|e| ProcessingError::InvalidInput(format!("malformed payload: {e}")))
}

/// Payload for invoice.uploaded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceUploadedV1 {
    pub invoice_id: String,
    pub document_id: String,
    pub filename: String,
    pub size: u64,
    pub storage_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
}

/// Structured fields produced by the extraction stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub vendor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub po_number: Option<String>,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_terms: Option<String>,
    /// Extraction confidence in [0, 1].
    pub confidence: f64,
}

/// Payload for invoice.processed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceProcessedV1 {
    pub invoice_id: String,
    pub extracted_data: ExtractedFields,
    pub ocr_confidence: f64,
}

/// Payload for invoice.approved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceApprovedV1 {
    pub invoice_id: String,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

/// Payload for invoice.rejected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRejectedV1 {
    pub invoice_id: String,
    pub actor: String,
    pub reason: String,
}

/// Payload for invoice.paid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoicePaidV1 {
    pub invoice_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub transaction_id: String,
}

/// Payload for approval.requested
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequestedV1 {
    pub invoice_id: String,
    pub required_approvers: Vec<String>,
    pub due_date: DateTime<Utc>,
}

/// Payload for approval.assigned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalAssignedV1 {
    pub task_id: String,
    pub invoice_id: String,
    pub approver_id: String,
}

/// Payload for approval.completed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalCompletedV1 {
    pub task_id: String,
    pub invoice_id: String,
    pub approver_id: String,
    pub decision: ApprovalDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

/// Payload for system.error / system.warning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemErrorV1 {
    pub component: String,
    pub error: String,
    pub severity: String,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn uploaded_payload_round_trips_through_message_data() {
        let payload = InvoiceUploadedV1 {
            invoice_id: "inv-1".into(),
            document_id: "doc-1".into(),
            filename: "scan.pdf".into(),
            size: 4096,
            storage_path: "t1/2026/08/01/doc-1.pdf".into(),
            vendor_id: None,
        };

        let data = encode(&payload).unwrap();
        assert!(data.get("vendor_id").is_none(), "absent optionals stay off the wire");
        let back: InvoiceUploadedV1 = decode(&data).unwrap();
        assert_eq!(back.invoice_id, "inv-1");
        assert_eq!(back.size, 4096);
    }

    #[test]
    fn decode_rejects_missing_required_fields() {
        let mut data = serde_json::Map::new();
        data.insert("invoice_id".into(), serde_json::json!("inv-1"));
        let result: ProcessingResult<InvoicePaidV1> = decode(&data);
        assert!(matches!(result, Err(ProcessingError::InvalidInput(_))));
    }

    #[test]
    fn decimal_amounts_survive_the_wire() {
        let payload = InvoicePaidV1 {
            invoice_id: "inv-1".into(),
            amount: Decimal::new(1234567, 2), // 12345.67
            currency: "USD".into(),
            transaction_id: "txn-1".into(),
        };
        let data = encode(&payload).unwrap();
        let back: InvoicePaidV1 = decode(&data).unwrap();
        assert_eq!(back.amount, Decimal::new(1234567, 2));
    }

    #[test]
    fn approval_decision_uses_snake_case_wire_names() {
        let payload = ApprovalCompletedV1 {
            task_id: "task-1".into(),
            invoice_id: "inv-1".into(),
            approver_id: "u1".into(),
            decision: ApprovalDecision::Approved,
            comments: None,
        };
        let data = encode(&payload).unwrap();
        assert_eq!(data["decision"], serde_json::json!("approved"));
    }
}
