//! Workflow record storage. Written only by the state machine.

use crate::error::{ProcessingError, ProcessingResult};
use crate::workflow::state_machine::WorkflowRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait WorkflowRepo: Send + Sync {
    async fn insert(&self, record: WorkflowRecord) -> ProcessingResult<()>;
    async fn get(&self, invoice_id: &str) -> ProcessingResult<Option<WorkflowRecord>>;
    async fn update(&self, record: WorkflowRecord) -> ProcessingResult<()>;
}

#[derive(Default)]
pub struct InMemoryWorkflowRepo {
    rows: Mutex<HashMap<String, WorkflowRecord>>,
}

impl InMemoryWorkflowRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepo for InMemoryWorkflowRepo {
    async fn insert(&self, record: WorkflowRecord) -> ProcessingResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&record.invoice_id) {
            return Err(ProcessingError::Integrity(format!(
                "workflow for invoice {} already exists",
                record.invoice_id
            )));
        }
        rows.insert(record.invoice_id.clone(), record);
        Ok(())
    }

    async fn get(&self, invoice_id: &str) -> ProcessingResult<Option<WorkflowRecord>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(invoice_id).cloned())
    }

    async fn update(&self, record: WorkflowRecord) -> ProcessingResult<()> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&record.invoice_id) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(ProcessingError::NotFound(format!(
                "workflow for invoice {}",
                record.invoice_id
            ))),
        }
    }
}
