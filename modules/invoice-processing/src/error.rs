//! Behavioral error taxonomy for the pipeline.
//!
//! Errors are classified by how the caller must react, not by where they
//! originated. The consumer boundary collapses the taxonomy into the bus
//! dispatcher's transient/fatal split: only `Transient` is retried.

use crate::models::InvoiceState;
use crate::workflow::state_machine::TransitionAction;
use event_bus::HandlerError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessingError {
    /// Retriable failure (backend unavailable, timeout). The bus redelivers
    /// with backoff until the retry budget runs out.
    #[error("transient failure: {0}")]
    Transient(String),

    /// User-supplied data failed validation; surfaced immediately, no state
    /// change.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The state machine rejected an action. Treated as a logic bug, never
    /// retried.
    #[error("invalid transition from {from} via {action}")]
    InvalidTransition {
        from: InvoiceState,
        action: TransitionAction,
    },

    /// Checksum mismatch or invariant violation; the operation aborts with
    /// no state change.
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Exact-hash duplicate at upload. The upload itself succeeds but the
    /// invoice is tagged and routed to review.
    #[error("duplicate conflict: {0}")]
    Conflict(String),
}

pub type ProcessingResult<T> = Result<T, ProcessingError>;

impl ProcessingError {
    /// Severity used when the failure is reported on `system.error`.
    pub fn severity(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } | Self::Integrity(_) => "critical",
            _ => "error",
        }
    }
}

impl From<ProcessingError> for HandlerError {
    fn from(err: ProcessingError) -> Self {
        match err {
            ProcessingError::Transient(reason) => HandlerError::Transient(reason),
            other => HandlerError::Fatal(other.to_string()),
        }
    }
}
