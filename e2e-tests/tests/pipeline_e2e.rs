//! End-to-end pipeline scenarios: documents flow from upload to their
//! terminal state through the live bus with all stage consumers running.

use chrono::Duration as ChronoDuration;
use event_bus::{BusConfig, EventBus, EventType, InMemoryBus, Message, MessagePriority};
use futures::StreamExt;
use invoice_processing::consumer::register_stage_consumers;
use invoice_processing::contracts::{decode, encode, ApprovalCompletedV1, ExtractedFields, InvoiceApprovedV1};
use invoice_processing::models::{ApprovalDecision, EscalationLevel, InvoiceState, SlaStatus, VendorProfile};
use invoice_processing::plugins::{FlakyOcrEngine, MockFieldExtractor, OcrEngine};
use invoice_processing::repos::VendorRepo;
use invoice_processing::{InvoiceService, ServiceRegistry, TenantConfig, UploadRequest};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

fn dec(n: i64) -> Decimal {
    Decimal::new(n, 0)
}

fn extraction(vendor: &str, number: &str, total: i64) -> ExtractedFields {
    ExtractedFields {
        vendor_name: vendor.to_string(),
        vendor_address: None,
        invoice_number: Some(number.to_string()),
        invoice_date: None,
        due_date: None,
        po_number: None,
        subtotal: dec(total),
        tax_amount: Decimal::ZERO,
        total_amount: dec(total),
        currency: "USD".to_string(),
        line_items: Vec::new(),
        payment_terms: Some("Net 30".to_string()),
        confidence: 0.95,
    }
}

struct Pipeline {
    bus: InMemoryBus,
    service: Arc<InvoiceService>,
    vendors: Arc<dyn VendorRepo>,
}

async fn start_pipeline(
    extracted: ExtractedFields,
    config: TenantConfig,
    ocr: Option<Arc<dyn OcrEngine>>,
) -> Pipeline {
    let bus = InMemoryBus::with_config(BusConfig {
        retry_base: Duration::from_millis(5),
        retry_cap: Duration::from_millis(20),
        ..BusConfig::default()
    });
    let bus_dyn: Arc<dyn EventBus> = Arc::new(bus.clone());

    let mut registry = ServiceRegistry::in_memory(bus_dyn.clone())
        .with_extractor(Arc::new(MockFieldExtractor::returning(extracted)))
        .with_tenant_config(config);
    if let Some(ocr) = ocr {
        registry = registry.with_ocr(ocr);
    }
    let vendors = registry.vendors.clone();
    let service = Arc::new(InvoiceService::new(registry));

    register_stage_consumers(&bus_dyn, &service).await.unwrap();
    bus_dyn.start_consumers().await.unwrap();

    Pipeline {
        bus,
        service,
        vendors,
    }
}

fn upload(vendor_id: Option<&str>, bytes: &[u8]) -> UploadRequest {
    UploadRequest {
        tenant_id: "t1".to_string(),
        filename: "scan.pdf".to_string(),
        bytes: bytes.to_vec(),
        vendor_id: vendor_id.map(str::to_string),
        uploaded_by: "u1".to_string(),
    }
}

async fn wait_for_state(service: &InvoiceService, invoice_id: &str, state: InvoiceState) {
    for _ in 0..500 {
        if let Some(invoice) = service.get_invoice(invoice_id).await.unwrap() {
            if invoice.state == state {
                // Let the stage handler finish publishing its follow-up
                // events before callers inspect the streams.
                tokio::time::sleep(Duration::from_millis(50)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let current = service
        .get_invoice(invoice_id)
        .await
        .unwrap()
        .map(|i| i.state);
    panic!("invoice {invoice_id} never reached {state:?}; currently {current:?}");
}

async fn events_of(bus: &InMemoryBus, event_type: EventType) -> Vec<Message> {
    bus.get_stream(event_type, 0, 1000)
        .await
        .unwrap()
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .map(|e| e.message)
        .collect()
}

// Scenario: the same bytes uploaded twice come back flagged as an exact
// duplicate of the first invoice.
#[tokio::test]
async fn duplicate_upload_is_detected_with_full_confidence() {
    let p = start_pipeline(
        extraction("Acme Corporation", "INV-1", 4900),
        TenantConfig::default(),
        None,
    )
    .await;

    let first = p
        .service
        .upload_document(upload(None, b"identical scan bytes"))
        .await
        .unwrap();
    wait_for_state(&p.service, &first.invoice_id, InvoiceState::ReviewPending).await;

    let second = p
        .service
        .upload_document(upload(None, b"identical scan bytes"))
        .await
        .unwrap();

    assert_eq!(second.duplicates.len(), 1);
    assert_eq!(second.duplicates[0].confidence, 1.0);
    assert_eq!(second.duplicates[0].original_id, first.invoice_id);
}

// Scenario: a small invoice from a verified vendor auto-approves straight
// through the pipeline with no approval task.
#[tokio::test]
async fn verified_vendor_small_invoice_auto_approves() {
    let mut config = TenantConfig::default();
    config.auto_approve_enabled = true;
    let p = start_pipeline(
        extraction("Acme Corporation", "INV-450", 450),
        config,
        None,
    )
    .await;

    let mut vendor = VendorProfile::new("v-001", "Acme Corporation", "USD");
    vendor.is_verified = true;
    p.vendors.upsert(vendor).await.unwrap();

    let outcome = p
        .service
        .upload_document(upload(Some("v-001"), b"small invoice"))
        .await
        .unwrap();
    wait_for_state(&p.service, &outcome.invoice_id, InvoiceState::Approved).await;

    assert!(p
        .service
        .pending_task(&outcome.invoice_id)
        .await
        .unwrap()
        .is_none());
    assert!(p
        .service
        .tasks_for_invoice(&outcome.invoice_id)
        .await
        .unwrap()
        .is_empty());

    let approved = events_of(&p.bus, EventType::InvoiceApproved).await;
    assert_eq!(approved.len(), 1);
    let payload: InvoiceApprovedV1 = decode(&approved[0].data).unwrap();
    assert_eq!(payload.actor, "system");
}

// Scenario: an invoice just under an approval threshold trips the
// threshold-splitting indicator and routes to manager review with a 48h SLA.
#[tokio::test]
async fn threshold_adjacent_invoice_requires_manager_approval() {
    let p = start_pipeline(
        extraction("Globex Industries", "INV-4900", 4900),
        TenantConfig::default(),
        None,
    )
    .await;

    let outcome = p
        .service
        .upload_document(upload(None, b"invoice for 4900"))
        .await
        .unwrap();
    wait_for_state(&p.service, &outcome.invoice_id, InvoiceState::ReviewPending).await;

    let invoice = p
        .service
        .get_invoice(&outcome.invoice_id)
        .await
        .unwrap()
        .unwrap();
    assert!(invoice
        .anomalies
        .contains(&"threshold_splitting".to_string()));

    let task = p
        .service
        .pending_task(&outcome.invoice_id)
        .await
        .unwrap()
        .expect("one approval task");
    assert_eq!(task.required_approvers, vec!["manager".to_string()]);

    let sla = p.service.sla().check(&outcome.invoice_id).expect("sla started");
    assert_eq!(sla.deadline - sla.created_at, ChronoDuration::hours(48));

    assert_eq!(events_of(&p.bus, EventType::ApprovalRequested).await.len(), 1);
    assert_eq!(events_of(&p.bus, EventType::ApprovalAssigned).await.len(), 1);
}

// Scenario: no decision by 36h puts the 48h review SLA into warning with at
// least a manager escalation; at 48h it breaches and goes executive.
#[tokio::test]
async fn undecided_review_escalates_as_the_clock_runs() {
    let p = start_pipeline(
        extraction("Globex Industries", "INV-4900", 4900),
        TenantConfig::default(),
        None,
    )
    .await;

    let outcome = p
        .service
        .upload_document(upload(None, b"forgotten invoice"))
        .await
        .unwrap();
    wait_for_state(&p.service, &outcome.invoice_id, InvoiceState::ReviewPending).await;

    let created = p
        .service
        .sla()
        .check(&outcome.invoice_id)
        .expect("sla started")
        .created_at;

    let at_36h = created + ChronoDuration::hours(36);
    let record = p.service.sla().check_at(&outcome.invoice_id, at_36h).unwrap();
    assert_eq!(record.status, SlaStatus::Warning);
    let action = p
        .service
        .sla()
        .next_escalation_at(&outcome.invoice_id, at_36h)
        .expect("36h without a decision escalates");
    assert!(action.level >= EscalationLevel::Manager);

    let at_48h = created + ChronoDuration::hours(48);
    let record = p.service.sla().check_at(&outcome.invoice_id, at_48h).unwrap();
    assert_eq!(record.status, SlaStatus::Breached);
    let action = p
        .service
        .sla()
        .next_escalation_at(&outcome.invoice_id, at_48h)
        .expect("breach escalates");
    assert_eq!(action.level, EscalationLevel::Executive);
}

// Scenario: an approval decision arriving on the bus moves the invoice to
// APPROVED, announces it, completes the SLA, and leaves an audit trail.
#[tokio::test]
async fn approval_decision_over_the_bus_completes_the_review() {
    let p = start_pipeline(
        extraction("Globex Industries", "INV-4900", 4900),
        TenantConfig::default(),
        None,
    )
    .await;

    let outcome = p
        .service
        .upload_document(upload(None, b"please approve"))
        .await
        .unwrap();
    wait_for_state(&p.service, &outcome.invoice_id, InvoiceState::ReviewPending).await;

    let task = p
        .service
        .pending_task(&outcome.invoice_id)
        .await
        .unwrap()
        .unwrap();
    let decision = ApprovalCompletedV1 {
        task_id: task.id,
        invoice_id: outcome.invoice_id.clone(),
        approver_id: "u1".to_string(),
        decision: ApprovalDecision::Approved,
        comments: None,
    };
    p.bus
        .publish(
            Message::new(EventType::ApprovalCompleted, encode(&decision).unwrap())
                .with_priority(MessagePriority::High)
                .with_correlation_id(outcome.correlation_id.clone()),
        )
        .await
        .unwrap();

    wait_for_state(&p.service, &outcome.invoice_id, InvoiceState::Approved).await;

    let approved = events_of(&p.bus, EventType::InvoiceApproved).await;
    assert_eq!(approved.len(), 1);
    let payload: InvoiceApprovedV1 = decode(&approved[0].data).unwrap();
    assert_eq!(payload.invoice_id, outcome.invoice_id);
    assert_eq!(payload.actor, "u1");
    assert_eq!(approved[0].correlation_id, outcome.correlation_id);

    assert!(p.service.sla().check(&outcome.invoice_id).is_none());

    let history = p
        .service
        .audit()
        .resource_history("invoice", &outcome.invoice_id);
    assert!(history.iter().any(|e| e.action == "approve"));
    for event in &history {
        assert!(p.service.audit().verify(event));
    }
}

// Scenario: a persistently failing OCR backend exhausts the retry budget,
// the message lands in the DLQ, system.error is announced, and the invoice
// stays in PROCESSING.
#[tokio::test]
async fn ocr_outage_dead_letters_after_retries_and_invoice_stays_processing() {
    let p = start_pipeline(
        extraction("Acme Corporation", "INV-1", 450),
        TenantConfig::default(),
        Some(Arc::new(FlakyOcrEngine::failing_times(100))),
    )
    .await;

    let outcome = p
        .service
        .upload_document(upload(None, b"unreadable scan"))
        .await
        .unwrap();

    // Wait for the retry budget to drain into the DLQ
    for _ in 0..500 {
        if !p.bus.dead_letters().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let dlq = p.bus.dead_letters().await;
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].original.event_type, EventType::InvoiceUploaded);
    assert_eq!(dlq[0].original.retry_count, 3);

    let errors = events_of(&p.bus, EventType::SystemError).await;
    assert!(!errors.is_empty());
    assert_eq!(errors[0].data["severity"], serde_json::json!("error"));

    // The orchestrator never advanced past PROCESSING and never marked ERROR
    let invoice = p
        .service
        .get_invoice(&outcome.invoice_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invoice.state, InvoiceState::Processing);
}
