use std::collections::HashMap;

use {anyhow::Result, async_trait::async_trait};

use crate::record::ContactVerificationRecord;

/// Persistent storage for contact verification records. Records form an
/// append-only audit trail: they are created and updated, never deleted.
#[async_trait]
pub trait ContactRecordStore: Send + Sync {
    async fn get_by_recipient(
        &self,
        recipient_id: i64,
    ) -> Result<Option<ContactVerificationRecord>>;

    async fn create(
        &self,
        record: ContactVerificationRecord,
    ) -> Result<ContactVerificationRecord>;

    async fn update(&self, record: &ContactVerificationRecord) -> Result<()>;
}

/// In-memory store for tests and single-process hosts.
#[derive(Default)]
pub struct MemoryContactStore {
    records: std::sync::RwLock<HashMap<i64, ContactVerificationRecord>>,
}

impl MemoryContactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContactRecordStore for MemoryContactStore {
    async fn get_by_recipient(
        &self,
        recipient_id: i64,
    ) -> Result<Option<ContactVerificationRecord>> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&recipient_id)
            .cloned())
    }

    async fn create(
        &self,
        record: ContactVerificationRecord,
    ) -> Result<ContactVerificationRecord> {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.recipient_id, record.clone());
        Ok(record)
    }

    async fn update(&self, record: &ContactVerificationRecord) -> Result<()> {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.recipient_id, record.clone());
        Ok(())
    }
}
