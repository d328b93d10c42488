//! Approval decision worker: consumes `approval.completed` and settles the
//! pending approval task.

use crate::contracts::{self, ApprovalCompletedV1};
use crate::error::ProcessingError;
use crate::services::invoice_service::InvoiceService;
use async_trait::async_trait;
use event_bus::{HandlerError, Message, MessageHandler};
use std::sync::Arc;
use tracing::{info_span, Instrument};

pub struct ApprovalConsumer {
    service: Arc<InvoiceService>,
}

impl ApprovalConsumer {
    pub fn new(service: Arc<InvoiceService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl MessageHandler for ApprovalConsumer {
    fn name(&self) -> &str {
        "approval-decision-stage"
    }

    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        let payload: ApprovalCompletedV1 = contracts::decode(&message.data)
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;

        let span = info_span!(
            "approval_decision_stage",
            task_id = %payload.task_id,
            invoice_id = %payload.invoice_id,
            message_id = %message.id,
            correlation_id = %message.correlation_id,
        );

        async {
            match self
                .service
                .process_approval_decision(payload.clone(), &message.correlation_id)
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
