//! # Audit Logging
//!
//! Append-only audit trail for enterprise compliance.
//!
//! Every event carries a SHA-256 checksum over a canonical JSON serialization
//! of the event minus the checksum field. `serde_json` objects are backed by
//! a BTreeMap, so key order in the canonical form is stable by construction.
//! Events are immutable once appended; [`AuditLogger::verify`] recomputes the
//! checksum and compares it against the stored value.
//!
//! Identifiers are monotonically increasing: `AE-YYYYMMDD-<8-digit counter>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Mutex;
use tracing::info;

/// Types of auditable events in the invoice pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEventType {
    #[serde(rename = "document.uploaded")]
    DocumentUploaded,
    #[serde(rename = "document.processed")]
    DocumentProcessed,

    #[serde(rename = "invoice.created")]
    InvoiceCreated,
    #[serde(rename = "invoice.updated")]
    InvoiceUpdated,
    #[serde(rename = "invoice.extracted")]
    InvoiceExtracted,
    #[serde(rename = "invoice.validated")]
    InvoiceValidated,

    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.transitioned")]
    WorkflowTransitioned,
    #[serde(rename = "workflow.review_requested")]
    ReviewRequested,
    #[serde(rename = "workflow.approved")]
    Approved,
    #[serde(rename = "workflow.rejected")]
    Rejected,
    #[serde(rename = "workflow.escalated")]
    Escalated,

    #[serde(rename = "system.error")]
    SystemError,
    #[serde(rename = "system.config_changed")]
    ConfigChanged,
    #[serde(rename = "system.rule_updated")]
    RuleUpdated,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentUploaded => "document.uploaded",
            Self::DocumentProcessed => "document.processed",
            Self::InvoiceCreated => "invoice.created",
            Self::InvoiceUpdated => "invoice.updated",
            Self::InvoiceExtracted => "invoice.extracted",
            Self::InvoiceValidated => "invoice.validated",
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowTransitioned => "workflow.transitioned",
            Self::ReviewRequested => "workflow.review_requested",
            Self::Approved => "workflow.approved",
            Self::Rejected => "workflow.rejected",
            Self::Escalated => "workflow.escalated",
            Self::SystemError => "system.error",
            Self::ConfigChanged => "system.config_changed",
            Self::RuleUpdated => "system.rule_updated",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    /// User id or "system"
    pub actor: String,
    pub tenant_id: String,
    /// invoice, document, approval_task, ...
    pub resource_type: String,
    pub resource_id: String,
    pub action: String,
    pub details: serde_json::Map<String, serde_json::Value>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub checksum: String,
}

impl AuditEvent {
    /// Compute the SHA-256 checksum over the canonical serialization of
    /// every field except `checksum` itself.
    pub fn compute_checksum(&self) -> String {
        let mut canonical = serde_json::Map::new();
        canonical.insert("id".into(), serde_json::json!(self.id));
        canonical.insert("event_type".into(), serde_json::json!(self.event_type.as_str()));
        canonical.insert("timestamp".into(), serde_json::json!(self.timestamp.to_rfc3339()));
        canonical.insert("actor".into(), serde_json::json!(self.actor));
        canonical.insert("tenant_id".into(), serde_json::json!(self.tenant_id));
        canonical.insert("resource_type".into(), serde_json::json!(self.resource_type));
        canonical.insert("resource_id".into(), serde_json::json!(self.resource_id));
        canonical.insert("action".into(), serde_json::json!(self.action));
        canonical.insert("details".into(), serde_json::Value::Object(self.details.clone()));
        canonical.insert("metadata".into(), serde_json::Value::Object(self.metadata.clone()));

        let serialized = serde_json::Value::Object(canonical).to_string();
        let digest = Sha256::digest(serialized.as_bytes());
        hex::encode(digest)
    }
}

/// Errors surfaced by the audit log.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("checksum mismatch for audit event {0}")]
    ChecksumMismatch(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Query filters; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub tenant_id: Option<String>,
    pub event_type: Option<AuditEventType>,
    pub actor: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Caps the result set; defaults to 100 when unset.
    pub limit: Option<usize>,
}

const DEFAULT_QUERY_LIMIT: usize = 100;

struct LogState {
    events: Vec<AuditEvent>,
    counter: u64,
}

/// Immutable audit logger.
///
/// Append-only; events have no owner after append. The in-process store is
/// the system of record for the pipeline run; durable persistence is an
/// external collaborator's concern.
pub struct AuditLogger {
    state: Mutex<LogState>,
    retention_days: i64,
}

impl AuditLogger {
    /// Retention defaults to 7 years (2555 days).
    pub fn new() -> Self {
        Self::with_retention_days(2555)
    }

    pub fn with_retention_days(retention_days: i64) -> Self {
        Self {
            state: Mutex::new(LogState {
                events: Vec::new(),
                counter: 0,
            }),
            retention_days,
        }
    }

    pub fn retention_days(&self) -> i64 {
        self.retention_days
    }

    /// Append an audit event. Events are immutable once logged.
    pub fn log(
        &self,
        event_type: AuditEventType,
        actor: &str,
        tenant_id: &str,
        resource_type: &str,
        resource_id: &str,
        action: &str,
        details: serde_json::Map<String, serde_json::Value>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> AuditEvent {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        state.counter += 1;
        let id = format!("AE-{}-{:08}", now.format("%Y%m%d"), state.counter);

        let mut event = AuditEvent {
            id: id.clone(),
            event_type,
            timestamp: now,
            actor: actor.to_string(),
            tenant_id: tenant_id.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            action: action.to_string(),
            details,
            metadata,
            checksum: String::new(),
        };
        event.checksum = event.compute_checksum();

        state.events.push(event.clone());
        drop(state);

        info!(
            event_id = %id,
            event_type = %event_type,
            actor,
            resource = %format_args!("{resource_type}:{resource_id}"),
            "Audit event logged"
        );

        event
    }

    /// Recompute the checksum and compare against the stored value.
    pub fn verify(&self, event: &AuditEvent) -> bool {
        event.compute_checksum() == event.checksum
    }

    /// Query events with filters; newest first, capped by `limit`
    /// (default 100).
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        let state = self.state.lock().unwrap();

        let mut results: Vec<AuditEvent> = state
            .events
            .iter()
            .filter(|e| query.tenant_id.as_deref().is_none_or(|t| e.tenant_id == t))
            .filter(|e| query.event_type.is_none_or(|t| e.event_type == t))
            .filter(|e| query.actor.as_deref().is_none_or(|a| e.actor == a))
            .filter(|e| {
                query
                    .resource_type
                    .as_deref()
                    .is_none_or(|r| e.resource_type == r)
            })
            .filter(|e| {
                query
                    .resource_id
                    .as_deref()
                    .is_none_or(|r| e.resource_id == r)
            })
            .filter(|e| query.from.is_none_or(|f| e.timestamp >= f))
            .filter(|e| query.to.is_none_or(|t| e.timestamp <= t))
            .cloned()
            .collect();

        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        results.truncate(query.limit.unwrap_or(DEFAULT_QUERY_LIMIT));
        results
    }

    /// Complete history for one resource, newest first.
    pub fn resource_history(&self, resource_type: &str, resource_id: &str) -> Vec<AuditEvent> {
        self.query(&AuditQuery {
            resource_type: Some(resource_type.to_string()),
            resource_id: Some(resource_id.to_string()),
            limit: Some(1000),
            ..Default::default()
        })
    }

    /// All activity for one actor, newest first.
    pub fn actor_activity(&self, actor: &str, from: Option<DateTime<Utc>>) -> Vec<AuditEvent> {
        self.query(&AuditQuery {
            actor: Some(actor.to_string()),
            from,
            limit: Some(1000),
            ..Default::default()
        })
    }

    /// Export the audit log for a tenant and date range in a
    /// compliance-ready JSON payload. Every record carries its checksum so
    /// the export is independently verifiable.
    pub fn export_for_compliance(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> serde_json::Value {
        let events = self.query(&AuditQuery {
            tenant_id: Some(tenant_id.to_string()),
            from: Some(from),
            to: Some(to),
            limit: Some(100_000),
            ..Default::default()
        });

        serde_json::json!({
            "export_date": Utc::now().to_rfc3339(),
            "tenant_id": tenant_id,
            "date_range": {
                "from": from.to_rfc3339(),
                "to": to.to_rfc3339(),
            },
            "event_count": events.len(),
            "events": events
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "id": e.id,
                        "type": e.event_type.as_str(),
                        "timestamp": e.timestamp.to_rfc3339(),
                        "actor": e.actor,
                        "resource": format!("{}:{}", e.resource_type, e.resource_id),
                        "action": e.action,
                        "details": e.details,
                        "checksum": e.checksum,
                    })
                })
                .collect::<Vec<_>>(),
        })
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn details(kv: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
        kv.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn log_sample(logger: &AuditLogger, tenant: &str, actor: &str, invoice: &str) -> AuditEvent {
        logger.log(
            AuditEventType::WorkflowTransitioned,
            actor,
            tenant,
            "invoice",
            invoice,
            "validate",
            details(&[("from", json!("extracted")), ("to", json!("validated"))]),
            serde_json::Map::new(),
        )
    }

    #[test]
    fn ids_are_monotonically_increasing() {
        let logger = AuditLogger::new();
        let a = log_sample(&logger, "t1", "system", "inv-1");
        let b = log_sample(&logger, "t1", "system", "inv-2");
        assert!(b.id > a.id);
        assert!(a.id.starts_with("AE-"));
        assert!(a.id.ends_with("00000001"));
    }

    #[test]
    fn every_logged_event_verifies() {
        let logger = AuditLogger::new();
        for i in 0..10 {
            let e = log_sample(&logger, "t1", "u1", &format!("inv-{i}"));
            assert!(logger.verify(&e));
        }
    }

    #[test]
    fn tampering_breaks_verification() {
        let logger = AuditLogger::new();
        let mut event = log_sample(&logger, "t1", "u1", "inv-1");
        event.action = "approve".to_string();
        assert!(!logger.verify(&event));

        let mut event = log_sample(&logger, "t1", "u1", "inv-2");
        event
            .metadata
            .insert("injected".into(), json!("value"));
        assert!(!logger.verify(&event), "metadata is covered by the checksum");
    }

    #[test]
    fn query_filters_combine() {
        let logger = AuditLogger::new();
        log_sample(&logger, "t1", "u1", "inv-1");
        log_sample(&logger, "t1", "u2", "inv-1");
        log_sample(&logger, "t2", "u1", "inv-2");

        let results = logger.query(&AuditQuery {
            tenant_id: Some("t1".into()),
            actor: Some("u1".into()),
            ..Default::default()
        });
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].resource_id, "inv-1");

        let by_resource = logger.resource_history("invoice", "inv-1");
        assert_eq!(by_resource.len(), 2);
    }

    #[test]
    fn query_returns_newest_first_and_respects_limit() {
        let logger = AuditLogger::new();
        for i in 0..5 {
            log_sample(&logger, "t1", "u1", &format!("inv-{i}"));
        }

        let results = logger.query(&AuditQuery {
            tenant_id: Some("t1".into()),
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].resource_id, "inv-4");
        assert_eq!(results[1].resource_id, "inv-3");
    }

    #[test]
    fn compliance_export_contains_checksums() {
        let logger = AuditLogger::new();
        log_sample(&logger, "t1", "u1", "inv-1");
        log_sample(&logger, "t2", "u1", "inv-2");

        let from = Utc::now() - chrono::Duration::hours(1);
        let to = Utc::now() + chrono::Duration::hours(1);
        let export = logger.export_for_compliance("t1", from, to);

        assert_eq!(export["tenant_id"], json!("t1"));
        assert_eq!(export["event_count"], json!(1));
        let checksum = export["events"][0]["checksum"].as_str().unwrap();
        assert_eq!(checksum.len(), 64);
    }
}
