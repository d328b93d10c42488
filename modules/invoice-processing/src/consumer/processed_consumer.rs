//! Validation and routing stage worker: consumes `invoice.processed`, runs
//! duplicate detection, risk scoring, and PO matching, then routes the
//! invoice to auto-approval or review.

use crate::contracts::{self, InvoiceProcessedV1};
use crate::error::ProcessingError;
use crate::services::invoice_service::InvoiceService;
use async_trait::async_trait;
use event_bus::{HandlerError, Message, MessageHandler};
use std::sync::Arc;
use tracing::{info_span, Instrument};

pub struct ProcessedConsumer {
    service: Arc<InvoiceService>,
}

impl ProcessedConsumer {
    pub fn new(service: Arc<InvoiceService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl MessageHandler for ProcessedConsumer {
    fn name(&self) -> &str {
        "validation-stage"
    }

    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        let payload: InvoiceProcessedV1 = contracts::decode(&message.data)
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;

        let span = info_span!(
            "validation_stage",
            invoice_id = %payload.invoice_id,
            message_id = %message.id,
            correlation_id = %message.correlation_id,
        );

        async {
            match self
                .service
                .process_extracted(payload.clone(), &message.correlation_id)
                .await
            {
                Ok(()) => Ok(()),
                Err(ProcessingError::Transient(reason)) => {
                    Err(HandlerError::Transient(reason))
                }
                Err(terminal) => {
                    self.service.mark_error(&payload.invoice_id, &terminal).await;
                    Err(HandlerError::Fatal(terminal.to_string()))
                }
            }
        }
        .instrument(span)
        .await
    }
}
