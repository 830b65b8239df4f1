//! In-process store, for tests and one-shot runs.

use super::{apply_set, DuplicatePolicy, RecordId, RecordStore, StoredInvoice};
use crate::error::StoreError;
use crate::record::InvoiceRecord;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

/// Records held in a `Vec` behind a `RwLock`, in insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<StoredInvoice>>,
    policy: DuplicatePolicy,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            policy,
        }
    }

    /// Number of stored records, duplicates included.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn latest_index(records: &[StoredInvoice], filename: &str) -> Option<usize> {
    records.iter().rposition(|r| r.record.filename == filename)
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(&self, record: &InvoiceRecord) -> Result<RecordId, StoreError> {
        let mut records = self.records.write().await;
        let existing = match self.policy {
            DuplicatePolicy::Replace => latest_index(&records, &record.filename),
            DuplicatePolicy::Append => None,
        };
        match existing {
            Some(i) => {
                let slot = &mut records[i];
                slot.record = record.clone();
                slot.stored_at = chrono::Utc::now();
                debug!("Replaced '{}' ({})", record.filename, slot.id);
                Ok(slot.id.clone())
            }
            None => {
                let stored = StoredInvoice::new(record.clone());
                let id = stored.id.clone();
                debug!("Inserted '{}' ({})", record.filename, id);
                records.push(stored);
                Ok(id)
            }
        }
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().await;
        let mut names: Vec<String> = Vec::new();
        for r in records.iter() {
            if !names.contains(&r.record.filename) {
                names.push(r.record.filename.clone());
            }
        }
        Ok(names)
    }

    async fn get(&self, filename: &str) -> Result<StoredInvoice, StoreError> {
        let records = self.records.read().await;
        latest_index(&records, filename)
            .map(|i| records[i].clone())
            .ok_or_else(|| StoreError::NotFound {
                filename: filename.to_string(),
            })
    }

    async fn update(&self, filename: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let i = latest_index(&records, filename).ok_or_else(|| StoreError::NotFound {
            filename: filename.to_string(),
        })?;
        apply_set(&mut records[i].record, fields)
    }
}
