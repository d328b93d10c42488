//! Purchase order storage, keyed by normalized PO number.

use crate::error::ProcessingResult;
use crate::services::po_matcher::{normalize_po_number, PurchaseOrder};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait PurchaseOrderRepo: Send + Sync {
    async fn get(&self, po_number: &str) -> ProcessingResult<Option<PurchaseOrder>>;
    async fn insert(&self, po: PurchaseOrder) -> ProcessingResult<()>;
    async fn all(&self) -> ProcessingResult<Vec<PurchaseOrder>>;
}

#[derive(Default)]
pub struct InMemoryPurchaseOrderRepo {
    rows: Mutex<HashMap<String, PurchaseOrder>>,
}

impl InMemoryPurchaseOrderRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PurchaseOrderRepo for InMemoryPurchaseOrderRepo {
    async fn get(&self, po_number: &str) -> ProcessingResult<Option<PurchaseOrder>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(&normalize_po_number(po_number)).cloned())
    }

    async fn insert(&self, po: PurchaseOrder) -> ProcessingResult<()> {
        let mut rows = self.rows.lock().unwrap();
        rows.insert(normalize_po_number(&po.po_number), po);
        Ok(())
    }

    async fn all(&self) -> ProcessingResult<Vec<PurchaseOrder>> {
        let rows = self.rows.lock().unwrap();
        let mut pos: Vec<PurchaseOrder> = rows.values().cloned().collect();
        pos.sort_by(|a, b| a.po_number.cmp(&b.po_number));
        Ok(pos)
    }
}
