//! # Invoice Processing
//!
//! Event-driven invoice pipeline: an uploaded document flows through
//! OCR and field extraction, duplicate detection, risk scoring, PO matching,
//! and an approval workflow with SLA tracking, coordinated over the platform
//! event bus.
//!
//! The orchestrator ([`services::invoice_service::InvoiceService`]) is the
//! single writer for invoice state; stage workers ([`consumer`]) are
//! stateless subscribers whose advancement is guarded by the invoice's
//! current state, making redelivery safe.

pub mod config;
pub mod consumer;
pub mod contracts;
pub mod error;
pub mod models;
pub mod plugins;
pub mod registry;
pub mod repos;
pub mod services;
pub mod text;
pub mod workflow;

pub use config::{Config, TenantConfig};
pub use error::{ProcessingError, ProcessingResult};
pub use registry::ServiceRegistry;
pub use services::invoice_service::{InvoiceService, UploadOutcome, UploadRequest};
