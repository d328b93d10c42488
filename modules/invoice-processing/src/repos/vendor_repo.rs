//! Vendor profile storage. Single writer per vendor via the ingest path.

use crate::error::ProcessingResult;
use crate::models::VendorProfile;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait VendorRepo: Send + Sync {
    async fn get(&self, vendor_id: &str) -> ProcessingResult<Option<VendorProfile>>;
    async fn upsert(&self, profile: VendorProfile) -> ProcessingResult<()>;
}

#[derive(Default)]
pub struct InMemoryVendorRepo {
    rows: Mutex<HashMap<String, VendorProfile>>,
}

impl InMemoryVendorRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VendorRepo for InMemoryVendorRepo {
    async fn get(&self, vendor_id: &str) -> ProcessingResult<Option<VendorProfile>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(vendor_id).cloned())
    }

    async fn upsert(&self, profile: VendorProfile) -> ProcessingResult<()> {
        let mut rows = self.rows.lock().unwrap();
        rows.insert(profile.vendor_id.clone(), profile);
        Ok(())
    }
}
