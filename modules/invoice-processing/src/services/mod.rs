//! Domain services: detection, scoring, matching, profiling, and the
//! orchestrator that binds them.

pub mod approval_rules;
pub mod duplicate_detector;
pub mod invoice_service;
pub mod po_matcher;
pub mod risk_scorer;
pub mod vendor_profiler;

pub use approval_rules::ApprovalRulesEngine;
pub use duplicate_detector::DuplicateDetector;
pub use invoice_service::{InvoiceService, UploadOutcome, UploadRequest};
pub use po_matcher::PoMatcher;
pub use risk_scorer::RiskScorer;
pub use vendor_profiler::VendorProfiler;
