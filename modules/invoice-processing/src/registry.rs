//! Process-wide service registry.
//!
//! Everything the orchestrator binds is constructed once at startup and
//! passed by reference; there are no ambient globals. The in-memory
//! constructor wires the default backends and mock plugins; production
//! deployments swap individual seams with the `with_*` builders.

use crate::config::TenantConfig;
use crate::contracts::ExtractedFields;
use crate::plugins::{
    DocumentStore, FieldExtractor, InMemoryDocumentStore, MockFieldExtractor, MockOcrEngine,
    MockSummarizer, OcrEngine, Summarizer,
};
use crate::repos::{
    ApprovalTaskRepo, InMemoryApprovalTaskRepo, InMemoryInvoiceRepo, InMemoryPurchaseOrderRepo,
    InMemoryVendorRepo, InMemoryWorkflowRepo, InvoiceRepo, PurchaseOrderRepo, VendorRepo,
};
use crate::services::approval_rules::ApprovalRulesEngine;
use crate::services::duplicate_detector::DuplicateDetector;
use crate::services::po_matcher::PoMatcher;
use crate::services::risk_scorer::RiskScorer;
use crate::services::vendor_profiler::VendorProfiler;
use crate::workflow::sla::{SlaConfig, SlaManager};
use crate::workflow::state_machine::StateMachine;
use event_bus::EventBus;
use platform_audit::AuditLogger;
use rust_decimal::Decimal;
use std::sync::Arc;

pub struct ServiceRegistry {
    pub bus: Arc<dyn EventBus>,
    pub invoices: Arc<dyn InvoiceRepo>,
    pub tasks: Arc<dyn ApprovalTaskRepo>,
    pub vendors: Arc<dyn VendorRepo>,
    pub purchase_orders: Arc<dyn PurchaseOrderRepo>,
    pub state_machine: Arc<StateMachine>,
    pub sla: Arc<SlaManager>,
    pub audit: Arc<AuditLogger>,
    pub duplicates: Arc<DuplicateDetector>,
    pub scorer: Arc<RiskScorer>,
    pub rules: Arc<ApprovalRulesEngine>,
    pub po_matcher: Arc<PoMatcher>,
    pub profiler: Arc<VendorProfiler>,
    pub ocr: Arc<dyn OcrEngine>,
    pub extractor: Arc<dyn FieldExtractor>,
    pub summarizer: Arc<dyn Summarizer>,
    pub store: Arc<dyn DocumentStore>,
    pub default_tenant_config: TenantConfig,
}

impl ServiceRegistry {
    /// Wire every seam with in-memory backends and mock plugins.
    pub fn in_memory(bus: Arc<dyn EventBus>) -> Self {
        let tenant_config = TenantConfig::default();

        let invoices = Arc::new(InMemoryInvoiceRepo::new());
        let tasks = Arc::new(InMemoryApprovalTaskRepo::new());
        let vendors: Arc<dyn VendorRepo> = Arc::new(InMemoryVendorRepo::new());
        let purchase_orders: Arc<dyn PurchaseOrderRepo> =
            Arc::new(InMemoryPurchaseOrderRepo::new());
        let workflows = Arc::new(InMemoryWorkflowRepo::new());

        Self {
            bus,
            invoices,
            tasks,
            vendors: vendors.clone(),
            purchase_orders: purchase_orders.clone(),
            state_machine: Arc::new(StateMachine::new(workflows)),
            sla: Arc::new(SlaManager::new(SlaConfig::default())),
            audit: Arc::new(AuditLogger::with_retention_days(
                tenant_config.retention_days,
            )),
            duplicates: Arc::new(DuplicateDetector::new(
                tenant_config.duplicate_hash_window_days,
                tenant_config.similar_window_days,
            )),
            scorer: Arc::new(RiskScorer::with_review_threshold(
                tenant_config.review_threshold,
            )),
            rules: Arc::new(ApprovalRulesEngine::new()),
            po_matcher: Arc::new(PoMatcher::new(purchase_orders)),
            profiler: Arc::new(VendorProfiler::new(vendors)),
            ocr: Arc::new(MockOcrEngine::new()),
            extractor: Arc::new(MockFieldExtractor::returning(placeholder_extraction())),
            summarizer: Arc::new(MockSummarizer),
            store: Arc::new(InMemoryDocumentStore::new()),
            default_tenant_config: tenant_config,
        }
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = ocr;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn FieldExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_tenant_config(mut self, config: TenantConfig) -> Self {
        self.default_tenant_config = config;
        self
    }
}

/// What the mock extractor yields before a test configures it: an invoice
/// with nothing recognized.
fn placeholder_extraction() -> ExtractedFields {
    ExtractedFields {
        vendor_name: "Unknown Vendor".to_string(),
        vendor_address: None,
        invoice_number: None,
        invoice_date: None,
        due_date: None,
        po_number: None,
        subtotal: Decimal::ZERO,
        tax_amount: Decimal::ZERO,
        total_amount: Decimal::ZERO,
        currency: "USD".to_string(),
        line_items: Vec::new(),
        payment_terms: None,
        confidence: 0.5,
    }
}
