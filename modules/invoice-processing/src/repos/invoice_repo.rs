//! Invoice storage.
//!
//! Single writer: only the orchestrator mutates invoices. Readers may query
//! concurrently.

use crate::error::{ProcessingError, ProcessingResult};
use crate::models::Invoice;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait InvoiceRepo: Send + Sync {
    async fn insert(&self, invoice: Invoice) -> ProcessingResult<()>;
    async fn get(&self, invoice_id: &str) -> ProcessingResult<Option<Invoice>>;
    async fn update(&self, invoice: Invoice) -> ProcessingResult<()>;
    async fn list_by_tenant(&self, tenant_id: &str) -> ProcessingResult<Vec<Invoice>>;
}

#[derive(Default)]
pub struct InMemoryInvoiceRepo {
    rows: Mutex<HashMap<String, Invoice>>,
}

impl InMemoryInvoiceRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceRepo for InMemoryInvoiceRepo {
    async fn insert(&self, invoice: Invoice) -> ProcessingResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&invoice.id) {
            return Err(ProcessingError::Integrity(format!(
                "invoice {} already exists",
                invoice.id
            )));
        }
        rows.insert(invoice.id.clone(), invoice);
        Ok(())
    }

    async fn get(&self, invoice_id: &str) -> ProcessingResult<Option<Invoice>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(invoice_id).cloned())
    }

    async fn update(&self, invoice: Invoice) -> ProcessingResult<()> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&invoice.id) {
            Some(slot) => {
                *slot = invoice;
                Ok(())
            }
            None => Err(ProcessingError::NotFound(format!(
                "invoice {}",
                invoice.id
            ))),
        }
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> ProcessingResult<Vec<Invoice>> {
        let rows = self.rows.lock().unwrap();
        let mut invoices: Vec<Invoice> = rows
            .values()
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(invoices)
    }
}
