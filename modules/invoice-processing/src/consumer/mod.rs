//! Stage workers: one consumer per pipeline stage.
//!
//! Workers are stateless; idempotence lives in the orchestrator's
//! state-guarded advancement. Each worker maps the error taxonomy onto the
//! bus dispatcher's transient/fatal split, so only genuinely retriable
//! failures are redelivered.

pub mod approval_consumer;
pub mod payment_consumer;
pub mod processed_consumer;
pub mod uploaded_consumer;

pub use approval_consumer::ApprovalConsumer;
pub use payment_consumer::PaymentConsumer;
pub use processed_consumer::ProcessedConsumer;
pub use uploaded_consumer::UploadedConsumer;

use crate::services::invoice_service::InvoiceService;
use event_bus::{BusResult, EventBus, EventType};
use std::sync::Arc;
use tracing::info;

/// Subscribe every stage worker to its event type. Call before
/// `start_consumers`.
pub async fn register_stage_consumers(
    bus: &Arc<dyn EventBus>,
    service: &Arc<InvoiceService>,
) -> BusResult<()> {
    bus.subscribe(
        EventType::InvoiceUploaded,
        Arc::new(UploadedConsumer::new(service.clone())),
    )
    .await?;
    bus.subscribe(
        EventType::InvoiceProcessed,
        Arc::new(ProcessedConsumer::new(service.clone())),
    )
    .await?;
    bus.subscribe(
        EventType::ApprovalCompleted,
        Arc::new(ApprovalConsumer::new(service.clone())),
    )
    .await?;
    bus.subscribe(
        EventType::InvoicePaid,
        Arc::new(PaymentConsumer::new(service.clone())),
    )
    .await?;

    info!("Stage consumers registered");
    Ok(())
}
