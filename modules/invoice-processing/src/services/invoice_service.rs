//! The invoice orchestrator.
//!
//! Single writer for invoices, workflow records, approval tasks, and SLA
//! records. All mutation runs under a per-invoice async lock, so state
//! transitions for one invoice are totally ordered while distinct invoices
//! proceed in parallel.
//!
//! Stage advancement is guarded by the invoice's current state: a message
//! redelivered for an invoice already past its target state acknowledges as
//! a no-op. External calls (OCR, extraction, storage) happen before any
//! mutation, so a failed or cancelled stage leaves no partial writes.

use crate::config::TenantConfig;
use crate::contracts::{
    self, ApprovalAssignedV1, ApprovalCompletedV1, ApprovalRequestedV1, ExtractedFields,
    InvoiceApprovedV1, InvoicePaidV1, InvoiceProcessedV1, InvoiceRejectedV1, InvoiceUploadedV1,
};
use crate::error::{ProcessingError, ProcessingResult};
use crate::models::{
    ApprovalDecision, ApprovalTask, Invoice, InvoiceState, SlaStatus, TaskPriority, TaskStatus,
};
use crate::plugins::{
    storage_key, with_timeout, DocumentStore, FieldExtractor, OcrEngine, Summarizer,
    OCR_TIMEOUT, STORAGE_TIMEOUT, SUMMARIZE_TIMEOUT,
};
use crate::registry::ServiceRegistry;
use crate::services::approval_rules::{rules_record, ApprovalRulesEngine, RuleAction};
use crate::services::duplicate_detector::{
    DuplicateCandidate, DuplicateDetector, DuplicateMatch, DuplicateMatchType,
};
use crate::services::po_matcher::{MatchStatus, PoMatcher};
use crate::services::risk_scorer::{RiskInput, RiskScorer};
use crate::services::vendor_profiler::{AnomalyKind, VendorProfiler};
use crate::workflow::sla::{EscalationAction, EscalationKind, SlaManager, SlaStage};
use crate::workflow::state_machine::{StateMachine, TransitionAction};
use chrono::Utc;
use event_bus::retry::{with_retries, RetryPolicy};
use event_bus::{EventBus, EventType, Message, MessagePriority};
use platform_audit::{AuditEventType, AuditLogger};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An upload handed to the orchestrator by the ingress layer.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub tenant_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub vendor_id: Option<String>,
    pub uploaded_by: String,
}

/// What the caller gets back from a successful upload.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub invoice_id: String,
    pub document_id: String,
    pub storage_path: String,
    pub correlation_id: String,
    /// Duplicate matches found at upload time, strongest first.
    pub duplicates: Vec<DuplicateMatch>,
}

pub struct InvoiceService {
    bus: Arc<dyn EventBus>,
    invoices: Arc<dyn crate::repos::InvoiceRepo>,
    tasks: Arc<dyn crate::repos::ApprovalTaskRepo>,
    state_machine: Arc<StateMachine>,
    sla: Arc<SlaManager>,
    audit: Arc<AuditLogger>,
    duplicates: Arc<DuplicateDetector>,
    scorer: Arc<RiskScorer>,
    rules: Arc<ApprovalRulesEngine>,
    po_matcher: Arc<PoMatcher>,
    profiler: Arc<VendorProfiler>,
    ocr: Arc<dyn OcrEngine>,
    extractor: Arc<dyn FieldExtractor>,
    summarizer: Arc<dyn Summarizer>,
    store: Arc<dyn DocumentStore>,
    default_config: TenantConfig,
    tenant_configs: Mutex<HashMap<String, TenantConfig>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InvoiceService {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            bus: registry.bus,
            invoices: registry.invoices,
            tasks: registry.tasks,
            state_machine: registry.state_machine,
            sla: registry.sla,
            audit: registry.audit,
            duplicates: registry.duplicates,
            scorer: registry.scorer,
            rules: registry.rules,
            po_matcher: registry.po_matcher,
            profiler: registry.profiler,
            ocr: registry.ocr,
            extractor: registry.extractor,
            summarizer: registry.summarizer,
            store: registry.store,
            default_config: registry.default_tenant_config,
            tenant_configs: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn sla(&self) -> &SlaManager {
        &self.sla
    }

    pub fn rules(&self) -> &ApprovalRulesEngine {
        &self.rules
    }

    /// Install a tenant-specific policy override.
    pub fn set_tenant_config(&self, tenant_id: &str, config: TenantConfig) {
        let mut configs = self.tenant_configs.lock().unwrap();
        configs.insert(tenant_id.to_string(), config);
    }

    pub fn tenant_config(&self, tenant_id: &str) -> TenantConfig {
        let configs = self.tenant_configs.lock().unwrap();
        configs
            .get(tenant_id)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }

    pub async fn get_invoice(&self, invoice_id: &str) -> ProcessingResult<Option<Invoice>> {
        self.invoices.get(invoice_id).await
    }

    pub async fn list_invoices(&self, tenant_id: &str) -> ProcessingResult<Vec<Invoice>> {
        self.invoices.list_by_tenant(tenant_id).await
    }

    pub async fn pending_task(&self, invoice_id: &str) -> ProcessingResult<Option<ApprovalTask>> {
        self.tasks.pending_for_invoice(invoice_id).await
    }

    pub async fn tasks_for_invoice(&self, invoice_id: &str) -> ProcessingResult<Vec<ApprovalTask>> {
        self.tasks.list_for_invoice(invoice_id).await
    }

    // ========================================================================
    // UPLOAD
    // ========================================================================

    /// Accept an uploaded document: assign identity, persist the bytes, run
    /// the upload-time duplicate check, create the invoice and its workflow,
    /// and announce `invoice.uploaded`.
    ///
    /// An exact-hash duplicate does not fail the upload; the invoice is
    /// tagged `duplicate_suspected` and forced through review, and the
    /// matches are returned to the caller.
    pub async fn upload_document(&self, request: UploadRequest) -> ProcessingResult<UploadOutcome> {
        if request.tenant_id.is_empty() {
            return Err(ProcessingError::InvalidInput("tenant_id is required".into()));
        }
        if request.filename.is_empty() {
            return Err(ProcessingError::InvalidInput("filename is required".into()));
        }
        if request.bytes.is_empty() {
            return Err(ProcessingError::InvalidInput("document is empty".into()));
        }

        let invoice_id = format!("inv-{}", Uuid::new_v4());
        let document_id = format!("doc-{}", Uuid::new_v4());
        let now = Utc::now();
        let hash = crate::services::duplicate_detector::content_hash(&request.bytes);

        // Serialize the upload path per (tenant, content hash) so the
        // duplicate check and the index registration are atomic for
        // concurrent uploads of the same bytes.
        let _guard = self
            .invoice_lock(&format!("upload/{}/{}", request.tenant_id, hash))
            .await;

        let ext = request
            .filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_else(|| "bin".to_string());
        let key = storage_key(&request.tenant_id, now, &document_id, &ext);
        let size = request.bytes.len() as u64;
        let storage_path = with_timeout(
            STORAGE_TIMEOUT,
            "document store put",
            self.store.put(&key, request.bytes),
        )
        .await?;

        let config = self.tenant_config(&request.tenant_id);
        let candidate = DuplicateCandidate {
            content_hash: hash.clone(),
            vendor_id: request.vendor_id.clone(),
            ..Default::default()
        };
        let duplicates = if config.duplicate_detection_enabled {
            self.duplicates.check_all(&request.tenant_id, &candidate)
        } else {
            Vec::new()
        };

        let mut invoice = Invoice {
            id: invoice_id.clone(),
            document_id: document_id.clone(),
            tenant_id: request.tenant_id.clone(),
            state: InvoiceState::Uploaded,
            vendor_id: request.vendor_id.clone(),
            vendor_name: None,
            vendor_address: None,
            invoice_number: None,
            invoice_date: None,
            due_date: None,
            currency: "USD".to_string(),
            subtotal: rust_decimal::Decimal::ZERO,
            tax_amount: rust_decimal::Decimal::ZERO,
            total_amount: rust_decimal::Decimal::ZERO,
            line_items: Vec::new(),
            po_number: None,
            payment_terms: None,
            risk_score: 0.0,
            risk_level: None,
            anomalies: Vec::new(),
            extraction_confidence: 0.0,
            requires_review: false,
            content_hash: hash,
            source_filename: request.filename.clone(),
            source_size: size,
            storage_path: storage_path.clone(),
            created_at: now,
            updated_at: now,
            created_by: request.uploaded_by.clone(),
        };

        let exact_duplicate = duplicates
            .iter()
            .any(|m| m.match_type == DuplicateMatchType::ExactHash && m.confidence >= 1.0);
        if exact_duplicate {
            warn!(
                invoice_id = %invoice_id,
                tenant_id = %request.tenant_id,
                "Exact duplicate upload detected, tagging for review"
            );
            invoice.anomalies.push("duplicate_suspected".to_string());
            invoice.requires_review = true;
        }

        self.invoices.insert(invoice.clone()).await?;
        self.state_machine.create_workflow(&invoice_id).await?;
        self.duplicates
            .register(&invoice_id, &request.tenant_id, &candidate);

        let mut details = serde_json::Map::new();
        details.insert("filename".into(), serde_json::json!(request.filename));
        details.insert("size".into(), serde_json::json!(size));
        details.insert("content_hash".into(), serde_json::json!(invoice.content_hash));
        details.insert("duplicates".into(), serde_json::json!(duplicates.len()));
        self.audit.log(
            AuditEventType::DocumentUploaded,
            &request.uploaded_by,
            &request.tenant_id,
            "invoice",
            &invoice_id,
            "upload",
            details,
            serde_json::Map::new(),
        );

        let payload = InvoiceUploadedV1 {
            invoice_id: invoice_id.clone(),
            document_id: document_id.clone(),
            filename: request.filename,
            size,
            storage_path: storage_path.clone(),
            vendor_id: request.vendor_id,
        };
        self.publish(
            EventType::InvoiceUploaded,
            contracts::encode(&payload)?,
            MessagePriority::High,
            &document_id,
        )
        .await?;

        Ok(UploadOutcome {
            invoice_id,
            document_id: document_id.clone(),
            storage_path,
            correlation_id: document_id,
            duplicates,
        })
    }

    // ========================================================================
    // STAGE: OCR + EXTRACTION
    // ========================================================================

    /// Run the OCR and extraction stage for an uploaded invoice, then
    /// announce `invoice.processed`.
    pub async fn process_uploaded(
        &self,
        payload: InvoiceUploadedV1,
        correlation_id: &str,
    ) -> ProcessingResult<()> {
        let _guard = self.invoice_lock(&payload.invoice_id).await;
        let mut invoice = self.get_required(&payload.invoice_id).await?;

        match invoice.state {
            InvoiceState::Uploaded => {
                self.advance(&mut invoice, TransitionAction::StartProcessing, "system", None)
                    .await?;
            }
            // A redelivery after a transient stage failure resumes here
            InvoiceState::Processing => {
                debug!(invoice_id = %invoice.id, "Resuming extraction stage after redelivery");
            }
            other => {
                info!(
                    invoice_id = %invoice.id,
                    state = %other,
                    "Invoice already past extraction stage, acknowledging"
                );
                return Ok(());
            }
        }

        let bytes = with_timeout(
            STORAGE_TIMEOUT,
            "document store get",
            self.store.get(&payload.storage_path),
        )
        .await?
        .ok_or_else(|| {
            ProcessingError::NotFound(format!("document bytes at {}", payload.storage_path))
        })?;

        // All fallible external work happens before any invoice mutation, so
        // a transient failure here leaves the invoice cleanly in PROCESSING.
        let ocr_result = with_timeout(OCR_TIMEOUT, "ocr", self.ocr.ocr(&bytes, "eng")).await?;
        let fields = with_timeout(
            OCR_TIMEOUT,
            "field extraction",
            self.extractor.extract(&ocr_result.full_text),
        )
        .await?;

        let config = self.tenant_config(&invoice.tenant_id);
        apply_extraction(&mut invoice, &fields);

        if ocr_result.overall_confidence < config.ocr_confidence_threshold {
            push_anomaly(&mut invoice, "low_ocr_confidence");
            invoice.requires_review = true;
        }
        if fields.confidence < config.ocr_confidence_threshold {
            push_anomaly(&mut invoice, "low_extraction_confidence");
            invoice.requires_review = true;
        }
        if !invoice.totals_consistent() {
            push_anomaly(&mut invoice, "total_mismatch");
            invoice.requires_review = true;
        }

        self.advance(&mut invoice, TransitionAction::CompleteOcr, "system", None)
            .await?;
        self.advance(&mut invoice, TransitionAction::CompleteExtraction, "system", None)
            .await?;

        if let Some((vendor_key, vendor_name)) = vendor_identity(&invoice) {
            self.profiler
                .ingest(&vendor_key, &vendor_name, &invoice)
                .await?;
        }

        let mut details = serde_json::Map::new();
        details.insert(
            "vendor".into(),
            serde_json::json!(invoice.vendor_name),
        );
        details.insert(
            "total_amount".into(),
            serde_json::json!(invoice.total_amount.to_string()),
        );
        details.insert(
            "ocr_confidence".into(),
            serde_json::json!(ocr_result.overall_confidence),
        );
        self.audit.log(
            AuditEventType::InvoiceExtracted,
            "system",
            &invoice.tenant_id,
            "invoice",
            &invoice.id,
            "extract",
            details,
            serde_json::Map::new(),
        );

        let processed = InvoiceProcessedV1 {
            invoice_id: invoice.id.clone(),
            extracted_data: fields,
            ocr_confidence: ocr_result.overall_confidence,
        };
        self.publish(
            EventType::InvoiceProcessed,
            contracts::encode(&processed)?,
            MessagePriority::Normal,
            correlation_id,
        )
        .await?;

        Ok(())
    }

    // ========================================================================
    // STAGE: VALIDATION + SCORING + ROUTING
    // ========================================================================

    /// Validate an extracted invoice (duplicates, risk, PO match), then
    /// route it: auto-approve, auto-reject, or queue an approval task with
    /// an SLA.
    pub async fn process_extracted(
        &self,
        payload: InvoiceProcessedV1,
        correlation_id: &str,
    ) -> ProcessingResult<()> {
        let _guard = self.invoice_lock(&payload.invoice_id).await;
        let mut invoice = self.get_required(&payload.invoice_id).await?;

        if invoice.state != InvoiceState::Extracted {
            info!(
                invoice_id = %invoice.id,
                state = %invoice.state,
                "Invoice already past validation stage, acknowledging"
            );
            return Ok(());
        }

        let config = self.tenant_config(&invoice.tenant_id);

        // Duplicate check runs before validation completes
        let candidate = DuplicateCandidate {
            content_hash: invoice.content_hash.clone(),
            vendor_name: invoice.vendor_name.clone(),
            vendor_id: invoice.vendor_id.clone(),
            invoice_number: invoice.invoice_number.clone(),
            amount: Some(invoice.total_amount),
        };
        let duplicate_matches: Vec<DuplicateMatch> = if config.duplicate_detection_enabled {
            self.duplicates
                .check_all(&invoice.tenant_id, &candidate)
                .into_iter()
                .filter(|m| m.original_id != invoice.id)
                .collect()
        } else {
            Vec::new()
        };
        if !duplicate_matches.is_empty() {
            push_anomaly(&mut invoice, "duplicate_suspected");
        }

        let vendor_identity = vendor_identity(&invoice);
        let (vendor_profile, unusual_timing) = match &vendor_identity {
            Some((vendor_key, _)) => {
                let report = self
                    .profiler
                    .check_anomaly(vendor_key, invoice.total_amount)
                    .await?;
                let profile = self.profiler.profile(vendor_key).await?;
                (profile, report.has(AnomalyKind::UnusualTiming))
            }
            None => (None, false),
        };

        let assessment = self.scorer.assess(&RiskInput {
            total_amount: invoice.total_amount,
            po_number: invoice.po_number.clone(),
            payment_terms: invoice.payment_terms.clone(),
            vendor_history: vendor_profile.as_ref().map(|p| p.statistics.clone()),
            vendor_risk: vendor_profile.as_ref().map(|p| p.risk_level),
            duplicate_confidence: duplicate_matches.first().map(|m| m.confidence),
            unusual_timing,
            approval_thresholds: config.risk_thresholds.clone(),
        });
        invoice.risk_score = assessment.overall_score;
        invoice.risk_level = Some(assessment.level);
        if assessment.requires_review {
            invoice.requires_review = true;
        }
        for indicator in &assessment.indicators {
            push_anomaly(&mut invoice, &indicator.factor.to_string());
        }

        let po_match = self.po_matcher.match_invoice(&invoice).await?;
        match po_match.status {
            MatchStatus::Mismatch => {
                push_anomaly(&mut invoice, "po_mismatch");
                invoice.requires_review = true;
            }
            MatchStatus::PoNotFound => push_anomaly(&mut invoice, "po_not_found"),
            _ => {}
        }

        // Register the extracted identity for future duplicate checks; the
        // content hash was already indexed at upload.
        self.duplicates.register(
            &invoice.id,
            &invoice.tenant_id,
            &DuplicateCandidate {
                content_hash: String::new(),
                ..candidate
            },
        );

        self.advance(&mut invoice, TransitionAction::Validate, "system", None)
            .await?;

        let mut details = serde_json::Map::new();
        details.insert("risk_score".into(), serde_json::json!(invoice.risk_score));
        details.insert("risk_level".into(), serde_json::json!(assessment.level));
        details.insert(
            "duplicates".into(),
            serde_json::json!(duplicate_matches.len()),
        );
        details.insert("po_match".into(), serde_json::json!(po_match.status));
        self.audit.log(
            AuditEventType::InvoiceValidated,
            "system",
            &invoice.tenant_id,
            "invoice",
            &invoice.id,
            "validate",
            details,
            serde_json::Map::new(),
        );

        self.route_validated(invoice, vendor_profile.as_ref(), &config, correlation_id)
            .await
    }

    /// Execute the rule engine's routing decision for a validated invoice.
    async fn route_validated(
        &self,
        mut invoice: Invoice,
        vendor_profile: Option<&crate::models::VendorProfile>,
        config: &TenantConfig,
        correlation_id: &str,
    ) -> ProcessingResult<()> {
        let record = rules_record(&invoice, vendor_profile);
        let triggered = self.rules.evaluate(&record);

        let mut auto_approve_rule: Option<String> = None;
        let mut auto_reject_rule: Option<String> = None;
        let mut approvers: Vec<String> = Vec::new();
        let mut assigned_to: Option<String> = None;
        let mut priority = TaskPriority::Normal;
        let mut escalate_to: Option<String> = None;

        for t in &triggered {
            match &t.action {
                RuleAction::AutoApprove => auto_approve_rule = Some(t.rule_id.clone()),
                RuleAction::AutoReject => auto_reject_rule = Some(t.rule_id.clone()),
                RuleAction::RequireApproval { level } => {
                    if !approvers.contains(level) {
                        approvers.push(level.clone());
                    }
                }
                RuleAction::AssignTo { actor } => assigned_to = Some(actor.clone()),
                RuleAction::SetPriority { priority: p } => priority = priority.max(*p),
                RuleAction::AddTag { tag } => push_anomaly(&mut invoice, tag),
                RuleAction::Escalate { to } => escalate_to = Some(to.clone()),
                RuleAction::SendNotification => {
                    debug!(invoice_id = %invoice.id, rule = %t.rule_id, "Notification requested by rule")
                }
            }
        }

        let auto_approve_allowed = auto_approve_rule.is_some()
            && config.auto_approve_enabled
            && invoice.total_amount <= config.auto_approve_max_amount;

        if let Some(rule_id) = auto_reject_rule {
            // The table has no direct validated→rejected edge; an automatic
            // rejection passes through review with the system as actor.
            self.advance(&mut invoice, TransitionAction::RequestReview, "system", None)
                .await?;
            self.advance(
                &mut invoice,
                TransitionAction::Reject,
                "system",
                Some(&format!("auto-rejected by rule {rule_id}")),
            )
            .await?;

            let payload = InvoiceRejectedV1 {
                invoice_id: invoice.id.clone(),
                actor: "system".to_string(),
                reason: format!("auto-rejected by rule {rule_id}"),
            };
            self.publish(
                EventType::InvoiceRejected,
                contracts::encode(&payload)?,
                MessagePriority::Normal,
                correlation_id,
            )
            .await?;
            self.audit_workflow(&invoice, AuditEventType::Rejected, "system", "auto_reject");
            return Ok(());
        }

        if auto_approve_allowed {
            let rule_id = auto_approve_rule.unwrap_or_default();
            self.advance(
                &mut invoice,
                TransitionAction::Approve,
                "system",
                Some(&format!("auto-approved by rule {rule_id}")),
            )
            .await?;

            let payload = InvoiceApprovedV1 {
                invoice_id: invoice.id.clone(),
                actor: "system".to_string(),
                comments: Some(format!("auto-approved by rule {rule_id}")),
            };
            self.publish(
                EventType::InvoiceApproved,
                contracts::encode(&payload)?,
                MessagePriority::Normal,
                correlation_id,
            )
            .await?;
            self.audit_workflow(&invoice, AuditEventType::Approved, "system", "auto_approve");
            return Ok(());
        }

        // Review path
        self.advance(&mut invoice, TransitionAction::RequestReview, "system", None)
            .await?;

        if approvers.is_empty() {
            approvers.push(tier_approver(invoice.total_amount, &config.approval_tiers));
        }
        if escalate_to.is_some() && priority < TaskPriority::High {
            priority = TaskPriority::High;
        }

        let summary = match with_timeout(
            SUMMARIZE_TIMEOUT,
            "summarization",
            self.summarizer
                .summarize(&invoice, approvers[0].as_str(), "approval review"),
        )
        .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(invoice_id = %invoice.id, error = %e, "Summarizer unavailable, using template");
                crate::plugins::template_summary(&invoice)
            }
        };

        let task_id = format!("task-{}", Uuid::new_v4());
        let due_date = Utc::now() + chrono::Duration::hours(config.sla_breach_hours);
        let assignee = assigned_to
            .or(escalate_to)
            .unwrap_or_else(|| approvers[0].clone());

        let task = ApprovalTask {
            id: task_id.clone(),
            invoice_id: invoice.id.clone(),
            status: TaskStatus::Pending,
            priority,
            required_approvers: approvers.clone(),
            assigned_to: Some(assignee.clone()),
            assigned_role: Some(approvers[0].clone()),
            due_date,
            sla_status: SlaStatus::OnTrack,
            action_taken: None,
            decided_by: None,
            decided_at: None,
            comments: None,
            delegated_to: None,
            summary: Some(summary),
            created_at: Utc::now(),
        };
        self.tasks.insert(task).await?;
        self.sla
            .create(&invoice.id, SlaStage::Review, Some(&assignee));

        let requested = ApprovalRequestedV1 {
            invoice_id: invoice.id.clone(),
            required_approvers: approvers,
            due_date,
        };
        self.publish(
            EventType::ApprovalRequested,
            contracts::encode(&requested)?,
            MessagePriority::High,
            correlation_id,
        )
        .await?;

        let assigned = ApprovalAssignedV1 {
            task_id,
            invoice_id: invoice.id.clone(),
            approver_id: assignee,
        };
        self.publish(
            EventType::ApprovalAssigned,
            contracts::encode(&assigned)?,
            MessagePriority::Normal,
            correlation_id,
        )
        .await?;

        self.audit_workflow(
            &invoice,
            AuditEventType::ReviewRequested,
            "system",
            "request_review",
        );
        Ok(())
    }

    // ========================================================================
    // STAGE: APPROVAL DECISION
    // ========================================================================

    /// Apply an approval decision from `approval.completed`.
    pub async fn process_approval_decision(
        &self,
        payload: ApprovalCompletedV1,
        correlation_id: &str,
    ) -> ProcessingResult<()> {
        let _guard = self.invoice_lock(&payload.invoice_id).await;
        let mut invoice = self.get_required(&payload.invoice_id).await?;
        let mut task = self
            .tasks
            .get(&payload.task_id)
            .await?
            .ok_or_else(|| ProcessingError::NotFound(format!("approval task {}", payload.task_id)))?;

        if task.status.is_terminal() {
            info!(
                task_id = %task.id,
                status = ?task.status,
                "Approval task already decided, acknowledging"
            );
            return Ok(());
        }
        if invoice.state != InvoiceState::ReviewPending {
            info!(
                invoice_id = %invoice.id,
                state = %invoice.state,
                "Invoice not awaiting review, acknowledging"
            );
            return Ok(());
        }

        let now = Utc::now();
        match payload.decision {
            ApprovalDecision::Approved => {
                task.status = TaskStatus::Approved;
                task.action_taken = Some("approved".to_string());
                task.decided_by = Some(payload.approver_id.clone());
                task.decided_at = Some(now);
                task.comments = payload.comments.clone();
                self.tasks.update(task).await?;

                self.advance(
                    &mut invoice,
                    TransitionAction::Approve,
                    &payload.approver_id,
                    payload.comments.as_deref(),
                )
                .await?;

                let approved = InvoiceApprovedV1 {
                    invoice_id: invoice.id.clone(),
                    actor: payload.approver_id.clone(),
                    comments: payload.comments,
                };
                self.publish(
                    EventType::InvoiceApproved,
                    contracts::encode(&approved)?,
                    MessagePriority::Normal,
                    correlation_id,
                )
                .await?;

                self.complete_sla(&invoice);
                self.audit_workflow(&invoice, AuditEventType::Approved, &payload.approver_id, "approve");
            }
            ApprovalDecision::Rejected => {
                task.status = TaskStatus::Rejected;
                task.action_taken = Some("rejected".to_string());
                task.decided_by = Some(payload.approver_id.clone());
                task.decided_at = Some(now);
                task.comments = payload.comments.clone();
                self.tasks.update(task).await?;

                self.advance(
                    &mut invoice,
                    TransitionAction::Reject,
                    &payload.approver_id,
                    payload.comments.as_deref(),
                )
                .await?;

                let rejected = InvoiceRejectedV1 {
                    invoice_id: invoice.id.clone(),
                    actor: payload.approver_id.clone(),
                    reason: payload
                        .comments
                        .unwrap_or_else(|| "Rejected by approver".to_string()),
                };
                self.publish(
                    EventType::InvoiceRejected,
                    contracts::encode(&rejected)?,
                    MessagePriority::Normal,
                    correlation_id,
                )
                .await?;

                self.complete_sla(&invoice);
                self.audit_workflow(&invoice, AuditEventType::Rejected, &payload.approver_id, "reject");
            }
            ApprovalDecision::Escalated => {
                task.status = TaskStatus::Escalated;
                task.priority = TaskPriority::Urgent;
                task.comments = payload.comments.clone();
                self.tasks.update(task).await?;
                self.audit_workflow(
                    &invoice,
                    AuditEventType::Escalated,
                    &payload.approver_id,
                    "escalate",
                );
            }
            ApprovalDecision::Delegated => {
                task.delegated_to = payload.comments.clone();
                self.tasks.update(task).await?;
                debug!(invoice_id = %invoice.id, "Approval task delegated");
            }
        }

        Ok(())
    }

    // ========================================================================
    // PAYMENT / RETRY / ARCHIVE
    // ========================================================================

    /// Record a completed payment: APPROVED → PAYMENT_PENDING → PAID.
    pub async fn confirm_payment(
        &self,
        payload: InvoicePaidV1,
        _correlation_id: &str,
    ) -> ProcessingResult<()> {
        let _guard = self.invoice_lock(&payload.invoice_id).await;
        let mut invoice = self.get_required(&payload.invoice_id).await?;

        match invoice.state {
            InvoiceState::Approved => {
                self.advance(&mut invoice, TransitionAction::RequestPayment, "system", None)
                    .await?;
                self.advance(&mut invoice, TransitionAction::ConfirmPayment, "system", None)
                    .await?;
            }
            InvoiceState::PaymentPending => {
                self.advance(&mut invoice, TransitionAction::ConfirmPayment, "system", None)
                    .await?;
            }
            InvoiceState::Paid | InvoiceState::Archived => {
                info!(invoice_id = %invoice.id, "Payment already recorded, acknowledging");
                return Ok(());
            }
            _ => {
                return Err(ProcessingError::InvalidTransition {
                    from: invoice.state,
                    action: TransitionAction::ConfirmPayment,
                })
            }
        }

        if payload.amount != invoice.total_amount {
            warn!(
                invoice_id = %invoice.id,
                paid = %payload.amount,
                billed = %invoice.total_amount,
                "Payment amount differs from invoice total"
            );
            push_anomaly(&mut invoice, "payment_amount_mismatch");
            self.invoices.update(invoice.clone()).await?;
        }

        let mut details = serde_json::Map::new();
        details.insert("amount".into(), serde_json::json!(payload.amount.to_string()));
        details.insert("currency".into(), serde_json::json!(payload.currency));
        details.insert(
            "transaction_id".into(),
            serde_json::json!(payload.transaction_id),
        );
        self.audit.log(
            AuditEventType::WorkflowTransitioned,
            "system",
            &invoice.tenant_id,
            "invoice",
            &invoice.id,
            "confirm_payment",
            details,
            serde_json::Map::new(),
        );

        Ok(())
    }

    /// Send a rejected or errored invoice back through the pipeline.
    pub async fn retry_invoice(&self, invoice_id: &str, actor: &str) -> ProcessingResult<()> {
        let _guard = self.invoice_lock(invoice_id).await;
        let mut invoice = self.get_required(invoice_id).await?;

        self.advance(&mut invoice, TransitionAction::Retry, actor, None)
            .await?;

        let payload = InvoiceUploadedV1 {
            invoice_id: invoice.id.clone(),
            document_id: invoice.document_id.clone(),
            filename: invoice.source_filename.clone(),
            size: invoice.source_size,
            storage_path: invoice.storage_path.clone(),
            vendor_id: invoice.vendor_id.clone(),
        };
        self.publish(
            EventType::InvoiceUploaded,
            contracts::encode(&payload)?,
            MessagePriority::High,
            &invoice.document_id,
        )
        .await
    }

    pub async fn archive_invoice(&self, invoice_id: &str, actor: &str) -> ProcessingResult<()> {
        let _guard = self.invoice_lock(invoice_id).await;
        let mut invoice = self.get_required(invoice_id).await?;
        self.advance(&mut invoice, TransitionAction::Archive, actor, None)
            .await
    }

    // ========================================================================
    // SLA SWEEP
    // ========================================================================

    /// Drive the escalation ladder for every at-risk SLA record. Returns the
    /// actions taken this sweep.
    pub async fn sweep_slas(&self) -> ProcessingResult<Vec<EscalationAction>> {
        let mut actions = Vec::new();

        for record in self.sla.all_at_risk() {
            let Some(action) = self.sla.next_escalation(&record.invoice_id) else {
                continue;
            };

            if let Some(mut task) = self.tasks.pending_for_invoice(&record.invoice_id).await? {
                task.sla_status = record.status;
                if action.kind == EscalationKind::Escalate {
                    task.priority = TaskPriority::Urgent;
                }
                self.tasks.update(task).await?;
            }

            if let Some(invoice) = self.invoices.get(&record.invoice_id).await? {
                let mut details = serde_json::Map::new();
                details.insert("level".into(), serde_json::json!(action.level));
                details.insert("reason".into(), serde_json::json!(action.reason));
                self.audit.log(
                    AuditEventType::Escalated,
                    "system",
                    &invoice.tenant_id,
                    "invoice",
                    &invoice.id,
                    "sla_escalation",
                    details,
                    serde_json::Map::new(),
                );
            }

            let mut data = serde_json::Map::new();
            data.insert("component".into(), serde_json::json!("sla-manager"));
            data.insert(
                "warning".into(),
                serde_json::json!(format!(
                    "invoice {} escalated to {}: {}",
                    action.invoice_id, action.level, action.reason
                )),
            );
            self.publish(
                EventType::SystemWarning,
                data,
                MessagePriority::High,
                &action.invoice_id,
            )
            .await?;

            actions.push(action);
        }

        Ok(actions)
    }

    // ========================================================================
    // FAILURE REPORTING
    // ========================================================================

    /// Record a terminal stage failure: transition to ERROR where the table
    /// allows it and announce on `system.error`. Best effort; never fails.
    pub async fn mark_error(&self, invoice_id: &str, error: &ProcessingError) {
        let transitioned = {
            let _guard = self.invoice_lock(invoice_id).await;
            match self.invoices.get(invoice_id).await {
                Ok(Some(mut invoice)) => {
                    match self
                        .advance(
                            &mut invoice,
                            TransitionAction::ReportError,
                            "system",
                            Some(&error.to_string()),
                        )
                        .await
                    {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(invoice_id, error = %e, "Invoice not moved to error state");
                            false
                        }
                    }
                }
                _ => false,
            }
        };

        let mut data = serde_json::Map::new();
        data.insert("component".into(), serde_json::json!("invoice-processing"));
        data.insert("error".into(), serde_json::json!(error.to_string()));
        data.insert("severity".into(), serde_json::json!(error.severity()));
        let mut details = serde_json::Map::new();
        details.insert("invoice_id".into(), serde_json::json!(invoice_id));
        details.insert("transitioned_to_error".into(), serde_json::json!(transitioned));
        data.insert("details".into(), serde_json::Value::Object(details));

        if let Err(e) = self
            .publish(EventType::SystemError, data, MessagePriority::High, invoice_id)
            .await
        {
            warn!(invoice_id, error = %e, "Failed to announce stage failure");
        }

        if let Ok(Some(invoice)) = self.get_invoice(invoice_id).await {
            let mut details = serde_json::Map::new();
            details.insert("error".into(), serde_json::json!(error.to_string()));
            details.insert("severity".into(), serde_json::json!(error.severity()));
            self.audit.log(
                AuditEventType::SystemError,
                "system",
                &invoice.tenant_id,
                "invoice",
                invoice_id,
                "stage_failure",
                details,
                serde_json::Map::new(),
            );
        }
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn invoice_lock(&self, invoice_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(invoice_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn get_required(&self, invoice_id: &str) -> ProcessingResult<Invoice> {
        self.invoices
            .get(invoice_id)
            .await?
            .ok_or_else(|| ProcessingError::NotFound(format!("invoice {invoice_id}")))
    }

    /// Run one state-machine transition and mirror the new state onto the
    /// invoice record.
    async fn advance(
        &self,
        invoice: &mut Invoice,
        action: TransitionAction,
        actor: &str,
        comment: Option<&str>,
    ) -> ProcessingResult<()> {
        let from = invoice.state;
        let record = self
            .state_machine
            .transition(&invoice.id, action, Some(actor), comment, serde_json::Map::new())
            .await?;
        invoice.state = record.current_state;
        invoice.updated_at = Utc::now();
        self.invoices.update(invoice.clone()).await?;

        let mut details = serde_json::Map::new();
        details.insert("from".into(), serde_json::json!(from));
        details.insert("to".into(), serde_json::json!(invoice.state));
        self.audit.log(
            AuditEventType::WorkflowTransitioned,
            actor,
            &invoice.tenant_id,
            "invoice",
            &invoice.id,
            action.as_str(),
            details,
            serde_json::Map::new(),
        );
        Ok(())
    }

    fn complete_sla(&self, invoice: &Invoice) {
        if let Some(completion) = self.sla.complete(&invoice.id) {
            info!(
                invoice_id = %invoice.id,
                hours = completion.processing_time_hours,
                was_breached = completion.was_breached,
                "SLA completed"
            );
        }
    }

    fn audit_workflow(&self, invoice: &Invoice, event_type: AuditEventType, actor: &str, action: &str) {
        let mut details = serde_json::Map::new();
        details.insert("state".into(), serde_json::json!(invoice.state));
        self.audit.log(
            event_type,
            actor,
            &invoice.tenant_id,
            "invoice",
            &invoice.id,
            action,
            details,
            serde_json::Map::new(),
        );
    }

    async fn publish(
        &self,
        event_type: EventType,
        data: serde_json::Map<String, serde_json::Value>,
        priority: MessagePriority,
        correlation_id: &str,
    ) -> ProcessingResult<()> {
        let message = Message::new(event_type, data)
            .with_priority(priority)
            .with_correlation_id(correlation_id);

        with_retries(
            &RetryPolicy::default(),
            event_type.as_str(),
            || self.bus.publish(message.clone()),
        )
        .await
        .map_err(|e| ProcessingError::Transient(format!("publish {event_type} failed: {e}")))
    }
}

/// Copy extracted fields onto the invoice record.
fn apply_extraction(invoice: &mut Invoice, fields: &ExtractedFields) {
    invoice.vendor_name = Some(fields.vendor_name.clone());
    invoice.vendor_address = fields.vendor_address.clone();
    invoice.invoice_number = fields.invoice_number.clone();
    invoice.invoice_date = fields.invoice_date;
    invoice.due_date = fields.due_date;
    invoice.po_number = fields.po_number.clone();
    invoice.subtotal = fields.subtotal;
    invoice.tax_amount = fields.tax_amount;
    invoice.total_amount = fields.total_amount;
    invoice.currency = fields.currency.clone();
    invoice.line_items = fields.line_items.clone();
    invoice.payment_terms = fields.payment_terms.clone();
    invoice.extraction_confidence = fields.confidence;
}

fn push_anomaly(invoice: &mut Invoice, tag: &str) {
    if !invoice.anomalies.iter().any(|a| a == tag) {
        invoice.anomalies.push(tag.to_string());
    }
}

/// Fallback approver level when no routing rule named one, derived from the
/// tenant's approval tiers.
fn tier_approver(amount: rust_decimal::Decimal, tiers: &[rust_decimal::Decimal]) -> String {
    let crossed = tiers.iter().filter(|t| amount >= **t).count();
    match crossed {
        0 | 1 => "manager",
        2 => "director",
        _ => "executive",
    }
    .to_string()
}

/// Stable vendor key: the upstream vendor id when present, otherwise a slug
/// of the extracted vendor name.
fn vendor_identity(invoice: &Invoice) -> Option<(String, String)> {
    let name = invoice.vendor_name.clone().filter(|n| !n.is_empty());
    if let Some(id) = invoice.vendor_id.clone().filter(|v| !v.is_empty()) {
        return Some((id.clone(), name.unwrap_or(id)));
    }
    let name = name?;
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    Some((format!("v-{}", slug.trim_matches('-')), name))
}
