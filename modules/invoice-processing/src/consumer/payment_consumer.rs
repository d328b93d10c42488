//! Payment confirmation worker: consumes `invoice.paid` published by the
//! payment adapter and moves the invoice to PAID.

use crate::contracts::{self, InvoicePaidV1};
use crate::error::ProcessingError;
use crate::services::invoice_service::InvoiceService;
use async_trait::async_trait;
use event_bus::{HandlerError, Message, MessageHandler};
use std::sync::Arc;
use tracing::{info_span, Instrument};

pub struct PaymentConsumer {
    service: Arc<InvoiceService>,
}

impl PaymentConsumer {
    pub fn new(service: Arc<InvoiceService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl MessageHandler for PaymentConsumer {
    fn name(&self) -> &str {
        "payment-stage"
    }

    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        let payload: InvoicePaidV1 = contracts::decode(&message.data)
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;

        let span = info_span!(
            "payment_stage",
            invoice_id = %payload.invoice_id,
            message_id = %message.id,
            correlation_id = %message.correlation_id,
        );

        async {
            match self
                .service
                .confirm_payment(payload.clone(), &message.correlation_id)
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
