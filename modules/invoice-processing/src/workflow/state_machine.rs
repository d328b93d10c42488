//! Invoice workflow state machine.
//!
//! Manages lifecycle transitions and enforces valid paths. The transition
//! table is total on (state, action); any pair outside it fails with
//! `InvalidTransition`. Every executed transition is appended to the
//! invoice's workflow history, so the last history entry's `to_state` always
//! equals the current state.

use crate::error::{ProcessingError, ProcessingResult};
use crate::models::InvoiceState;
use crate::repos::WorkflowRepo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Actions that trigger state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionAction {
    StartProcessing,
    CompleteOcr,
    CompleteExtraction,
    Validate,
    RequestReview,
    Approve,
    Reject,
    RequestPayment,
    ConfirmPayment,
    Archive,
    ReportError,
    Retry,
}

impl TransitionAction {
    pub const ALL: [TransitionAction; 12] = [
        Self::StartProcessing,
        Self::CompleteOcr,
        Self::CompleteExtraction,
        Self::Validate,
        Self::RequestReview,
        Self::Approve,
        Self::Reject,
        Self::RequestPayment,
        Self::ConfirmPayment,
        Self::Archive,
        Self::ReportError,
        Self::Retry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartProcessing => "start_processing",
            Self::CompleteOcr => "complete_ocr",
            Self::CompleteExtraction => "complete_extraction",
            Self::Validate => "validate",
            Self::RequestReview => "request_review",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::RequestPayment => "request_payment",
            Self::ConfirmPayment => "confirm_payment",
            Self::Archive => "archive",
            Self::ReportError => "report_error",
            Self::Retry => "retry",
        }
    }
}

impl fmt::Display for TransitionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The valid-transition table. Returns the target state, or `None` when the
/// (state, action) pair is not allowed.
pub fn transition_target(state: InvoiceState, action: TransitionAction) -> Option<InvoiceState> {
    use InvoiceState as S;
    use TransitionAction as A;

    match (state, action) {
        (S::Uploaded, A::StartProcessing) => Some(S::Processing),
        (
            S::Uploaded | S::Processing | S::OcrComplete | S::Extracted | S::PaymentPending,
            A::ReportError,
        ) => Some(S::Error),
        (S::Processing, A::CompleteOcr) => Some(S::OcrComplete),
        (S::OcrComplete, A::CompleteExtraction) => Some(S::Extracted),
        (S::Extracted, A::Validate) => Some(S::Validated),
        (S::Validated, A::RequestReview) => Some(S::ReviewPending),
        // Auto-approve path, driven by the rule engine's policy output
        (S::Validated, A::Approve) => Some(S::Approved),
        (S::ReviewPending, A::Approve) => Some(S::Approved),
        (S::ReviewPending, A::Reject) => Some(S::Rejected),
        (S::Approved, A::RequestPayment) => Some(S::PaymentPending),
        (S::PaymentPending, A::ConfirmPayment) => Some(S::Paid),
        (S::Paid | S::Rejected | S::Error, A::Archive) => Some(S::Archived),
        (S::Rejected | S::Error, A::Retry) => Some(S::Uploaded),
        _ => None,
    }
}

/// A state transition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: InvoiceState,
    pub to_state: InvoiceState,
    pub action: TransitionAction,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Current workflow state for an invoice, with its append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub invoice_id: String,
    pub current_state: InvoiceState,
    pub history: Vec<StateTransition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Hook invoked synchronously on entering a state. A failing hook is logged
/// and swallowed; it never rolls back the transition.
pub type EntryHook = Box<dyn Fn(&WorkflowRecord) -> Result<(), String> + Send + Sync>;

pub struct StateMachine {
    repo: Arc<dyn WorkflowRepo>,
    hooks: Mutex<HashMap<InvoiceState, Vec<EntryHook>>>,
}

impl StateMachine {
    pub fn new(repo: Arc<dyn WorkflowRepo>) -> Self {
        Self {
            repo,
            hooks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a workflow in the initial state.
    pub async fn create_workflow(&self, invoice_id: &str) -> ProcessingResult<WorkflowRecord> {
        let now = Utc::now();
        let record = WorkflowRecord {
            invoice_id: invoice_id.to_string(),
            current_state: InvoiceState::Uploaded,
            history: Vec::new(),
            assigned_to: None,
            due_date: None,
            created_at: now,
            updated_at: now,
        };
        self.repo.insert(record.clone()).await?;
        info!(invoice_id, state = %record.current_state, "Workflow created");
        Ok(record)
    }

    pub async fn get_workflow(&self, invoice_id: &str) -> ProcessingResult<Option<WorkflowRecord>> {
        self.repo.get(invoice_id).await
    }

    pub async fn can_transition(
        &self,
        invoice_id: &str,
        action: TransitionAction,
    ) -> ProcessingResult<bool> {
        let record = self.repo.get(invoice_id).await?;
        Ok(record
            .map(|r| transition_target(r.current_state, action).is_some())
            .unwrap_or(false))
    }

    /// Execute a state transition, appending it to the history and running
    /// entry hooks for the new state.
    pub async fn transition(
        &self,
        invoice_id: &str,
        action: TransitionAction,
        actor: Option<&str>,
        comment: Option<&str>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> ProcessingResult<WorkflowRecord> {
        let mut record = self
            .repo
            .get(invoice_id)
            .await?
            .ok_or_else(|| ProcessingError::NotFound(format!("workflow for invoice {invoice_id}")))?;

        let from_state = record.current_state;
        let to_state = transition_target(from_state, action).ok_or(
            ProcessingError::InvalidTransition {
                from: from_state,
                action,
            },
        )?;

        record.history.push(StateTransition {
            from_state,
            to_state,
            action,
            timestamp: Utc::now(),
            actor: actor.map(str::to_string),
            comment: comment.map(str::to_string),
            metadata,
        });
        record.current_state = to_state;
        record.updated_at = Utc::now();

        self.repo.update(record.clone()).await?;

        info!(
            invoice_id,
            from_state = %from_state,
            to_state = %to_state,
            action = %action,
            actor = actor.unwrap_or("system"),
            "State transition"
        );

        self.run_entry_hooks(to_state, &record);

        Ok(record)
    }

    /// Register a hook to run when entering a state.
    pub fn register_hook(&self, state: InvoiceState, hook: EntryHook) {
        let mut hooks = self.hooks.lock().unwrap();
        hooks.entry(state).or_default().push(hook);
    }

    pub async fn available_actions(
        &self,
        invoice_id: &str,
    ) -> ProcessingResult<Vec<TransitionAction>> {
        let record = self.repo.get(invoice_id).await?;
        Ok(match record {
            Some(r) => TransitionAction::ALL
                .into_iter()
                .filter(|a| transition_target(r.current_state, *a).is_some())
                .collect(),
            None => Vec::new(),
        })
    }

    fn run_entry_hooks(&self, state: InvoiceState, record: &WorkflowRecord) {
        let hooks = self.hooks.lock().unwrap();
        if let Some(for_state) = hooks.get(&state) {
            for hook in for_state {
                if let Err(e) = hook(record) {
                    error!(
                        invoice_id = %record.invoice_id,
                        state = %state,
                        error = %e,
                        "Entry hook failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::InMemoryWorkflowRepo;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn machine() -> StateMachine {
        StateMachine::new(Arc::new(InMemoryWorkflowRepo::new()))
    }

    #[tokio::test]
    async fn happy_path_reaches_paid() {
        let sm = machine();
        sm.create_workflow("inv-1").await.unwrap();

        for action in [
            TransitionAction::StartProcessing,
            TransitionAction::CompleteOcr,
            TransitionAction::CompleteExtraction,
            TransitionAction::Validate,
            TransitionAction::RequestReview,
            TransitionAction::Approve,
            TransitionAction::RequestPayment,
            TransitionAction::ConfirmPayment,
        ] {
            sm.transition("inv-1", action, Some("system"), None, serde_json::Map::new())
                .await
                .unwrap();
        }

        let record = sm.get_workflow("inv-1").await.unwrap().unwrap();
        assert_eq!(record.current_state, InvoiceState::Paid);
        assert_eq!(record.history.len(), 8);
        assert_eq!(record.history.last().unwrap().to_state, record.current_state);
    }

    #[tokio::test]
    async fn invalid_pairs_are_rejected() {
        let sm = machine();
        sm.create_workflow("inv-1").await.unwrap();

        let err = sm
            .transition(
                "inv-1",
                TransitionAction::Approve,
                None,
                None,
                serde_json::Map::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidTransition { .. }));

        // Rejection leaves the record untouched
        let record = sm.get_workflow("inv-1").await.unwrap().unwrap();
        assert_eq!(record.current_state, InvoiceState::Uploaded);
        assert!(record.history.is_empty());
    }

    #[tokio::test]
    async fn history_entries_all_come_from_the_table() {
        let sm = machine();
        sm.create_workflow("inv-1").await.unwrap();
        for action in [
            TransitionAction::StartProcessing,
            TransitionAction::ReportError,
            TransitionAction::Retry,
            TransitionAction::StartProcessing,
        ] {
            sm.transition("inv-1", action, None, None, serde_json::Map::new())
                .await
                .unwrap();
        }

        let record = sm.get_workflow("inv-1").await.unwrap().unwrap();
        for t in &record.history {
            assert_eq!(transition_target(t.from_state, t.action), Some(t.to_state));
        }
    }

    #[tokio::test]
    async fn error_state_supports_retry_and_archive() {
        let sm = machine();
        sm.create_workflow("inv-1").await.unwrap();
        sm.transition("inv-1", TransitionAction::ReportError, None, None, serde_json::Map::new())
            .await
            .unwrap();

        let actions = sm.available_actions("inv-1").await.unwrap();
        assert!(actions.contains(&TransitionAction::Retry));
        assert!(actions.contains(&TransitionAction::Archive));
        assert_eq!(actions.len(), 2);
    }

    #[tokio::test]
    async fn auto_approve_skips_review() {
        let sm = machine();
        sm.create_workflow("inv-1").await.unwrap();
        for action in [
            TransitionAction::StartProcessing,
            TransitionAction::CompleteOcr,
            TransitionAction::CompleteExtraction,
            TransitionAction::Validate,
            TransitionAction::Approve,
        ] {
            sm.transition("inv-1", action, None, None, serde_json::Map::new())
                .await
                .unwrap();
        }
        let record = sm.get_workflow("inv-1").await.unwrap().unwrap();
        assert_eq!(record.current_state, InvoiceState::Approved);
    }

    #[tokio::test]
    async fn failing_hook_does_not_roll_back() {
        let sm = machine();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        sm.register_hook(
            InvoiceState::Processing,
            Box::new(move |_record| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Err("hook exploded".to_string())
            }),
        );

        sm.create_workflow("inv-1").await.unwrap();
        let record = sm
            .transition(
                "inv-1",
                TransitionAction::StartProcessing,
                None,
                None,
                serde_json::Map::new(),
            )
            .await
            .unwrap();

        assert_eq!(record.current_state, InvoiceState::Processing);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
