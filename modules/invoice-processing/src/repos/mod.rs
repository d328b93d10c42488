//! Repository seams for the pipeline's persisted state.
//!
//! Every store is a trait so the backing technology can change without
//! touching the services. The in-memory backends are the default for
//! single-process deployments and tests; a durable backend implements the
//! same traits.

pub mod invoice_repo;
pub mod po_repo;
pub mod task_repo;
pub mod vendor_repo;
pub mod workflow_repo;

pub use invoice_repo::{InMemoryInvoiceRepo, InvoiceRepo};
pub use po_repo::{InMemoryPurchaseOrderRepo, PurchaseOrderRepo};
pub use task_repo::{ApprovalTaskRepo, InMemoryApprovalTaskRepo};
pub use vendor_repo::{InMemoryVendorRepo, VendorRepo};
pub use workflow_repo::{InMemoryWorkflowRepo, WorkflowRepo};
