//! Directory-backed store: one JSON document per record.
//!
//! Each record lives in `<dir>/<id>.json`. Writes go to `<id>.json.tmp` first
//! and are renamed into place, so a crash never leaves a half-written record.
//!
//! The directory is scanned once on [`FileStore::open`] to build a
//! filename → latest id index; unparseable files are skipped with a warning.
//! After that, `get` reads one file and `list` reads none. Records written
//! to the directory by another process after `open` are not seen until the
//! store is reopened.

use super::{apply_set, DuplicatePolicy, RecordId, RecordStore, StoredInvoice};
use crate::error::StoreError;
use crate::record::InvoiceRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct IndexEntry {
    id: RecordId,
    stored_at: DateTime<Utc>,
}

/// A [`RecordStore`] over a directory of JSON files.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    policy: DuplicatePolicy,
    /// Latest record per filename. Held across writes to serialise them.
    index: Mutex<HashMap<String, IndexEntry>>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Io {
                path: dir.clone(),
                source: e,
            })?;
        let index = load_index(&dir).await?;
        debug!("Opened record store {} ({} records)", dir.display(), index.len());
        Ok(Self {
            dir,
            policy: DuplicatePolicy::default(),
            index: Mutex::new(index),
        })
    }

    pub fn with_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &RecordId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn read(&self, filename: &str, id: &RecordId) -> Result<StoredInvoice, StoreError> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    filename: filename.to_string(),
                })
            }
            Err(e) => return Err(StoreError::Io { path, source: e }),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write(&self, stored: &StoredInvoice) -> Result<(), StoreError> {
        let path = self.path_for(&stored.id);
        let json = serde_json::to_vec_pretty(stored)?;

        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json)
            .await
            .map_err(|e| StoreError::Io {
                path: tmp_path.clone(),
                source: e,
            })?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| StoreError::Io {
                path: path.clone(),
                source: e,
            })?;
        Ok(())
    }
}

/// Scan `dir` and keep the most recently stored record per filename.
async fn load_index(dir: &Path) -> Result<HashMap<String, IndexEntry>, StoreError> {
    let io_err = |e| StoreError::Io {
        path: dir.to_path_buf(),
        source: e,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    let mut index: HashMap<String, IndexEntry> = HashMap::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = tokio::fs::read(&path).await.map_err(|e| StoreError::Io {
            path: path.clone(),
            source: e,
        })?;
        let stored = match serde_json::from_slice::<StoredInvoice>(&bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping unreadable record {}: {}", path.display(), e);
                continue;
            }
        };
        let newer = index
            .get(&stored.record.filename)
            .is_none_or(|cur| stored.stored_at > cur.stored_at);
        if newer {
            index.insert(
                stored.record.filename,
                IndexEntry {
                    id: stored.id,
                    stored_at: stored.stored_at,
                },
            );
        }
    }
    Ok(index)
}

#[async_trait]
impl RecordStore for FileStore {
    async fn upsert(&self, record: &InvoiceRecord) -> Result<RecordId, StoreError> {
        let mut index = self.index.lock().await;

        let mut stored = StoredInvoice::new(record.clone());
        if self.policy == DuplicatePolicy::Replace {
            if let Some(existing) = index.get(&record.filename) {
                stored.id = existing.id.clone();
            }
        }
        self.write(&stored).await?;
        index.insert(
            record.filename.clone(),
            IndexEntry {
                id: stored.id.clone(),
                stored_at: stored.stored_at,
            },
        );
        debug!("Stored '{}' as {}", record.filename, stored.id);
        Ok(stored.id)
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.index.lock().await.keys().cloned().collect())
    }

    async fn get(&self, filename: &str) -> Result<StoredInvoice, StoreError> {
        let id = self
            .index
            .lock()
            .await
            .get(filename)
            .map(|e| e.id.clone())
            .ok_or_else(|| StoreError::NotFound {
                filename: filename.to_string(),
            })?;
        self.read(filename, &id).await
    }

    async fn update(&self, filename: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let index = self.index.lock().await;
        let id = index
            .get(filename)
            .map(|e| e.id.clone())
            .ok_or_else(|| StoreError::NotFound {
                filename: filename.to_string(),
            })?;
        let mut stored = self.read(filename, &id).await?;
        apply_set(&mut stored.record, fields)?;
        self.write(&stored).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaKind;
    use serde_json::json;

    fn record(filename: &str, number: &str) -> InvoiceRecord {
        let fields = json!({
            "invoice_number": number,
            "purchaser_address": "12 Main St",
            "total_amount_with_gst": 42.5,
            "items": []
        });
        InvoiceRecord::new(filename, SchemaKind::Flat, fields.as_object().unwrap().clone())
    }

    #[tokio::test]
    async fn round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record("inv1.pdf", "INV-1");
        let id = {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.upsert(&rec).await.unwrap()
        };

        let store = FileStore::open(dir.path()).await.unwrap();
        let stored = store.get("inv1.pdf").await.unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.record, rec);
        assert!(dir.path().join(format!("{id}.json")).exists());
    }

    #[tokio::test]
    async fn update_sets_dotted_field_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.upsert(&record("inv1.pdf", "INV-1")).await.unwrap();

        let fields = json!({"invoice_number": "INV-7", "Meta.checked": true})
            .as_object()
            .unwrap()
            .clone();
        store.update("inv1.pdf", fields).await.unwrap();

        let got = store.get("inv1.pdf").await.unwrap().record;
        assert_eq!(got.fields["invoice_number"], "INV-7");
        assert_eq!(got.fields["Meta"]["checked"], true);
        assert_eq!(got.fields["purchaser_address"], "12 Main St");
    }

    #[tokio::test]
    async fn update_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let err = store.update("nope.pdf", Map::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn replace_reuses_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let a = store.upsert(&record("inv1.pdf", "INV-1")).await.unwrap();
        let b = store.upsert(&record("inv1.pdf", "INV-2")).await.unwrap();
        assert_eq!(a, b);

        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 1);
        let got = store.get("inv1.pdf").await.unwrap();
        assert_eq!(got.record.fields["invoice_number"], "INV-2");
    }

    #[tokio::test]
    async fn append_writes_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path())
            .await
            .unwrap()
            .with_policy(DuplicatePolicy::Append);
        let a = store.upsert(&record("inv1.pdf", "INV-1")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = store.upsert(&record("inv1.pdf", "INV-2")).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.list().await.unwrap(), vec!["inv1.pdf".to_string()]);
        assert_eq!(store.get("inv1.pdf").await.unwrap().id, b);

        // The index rebuilt on reopen picks the most recent file.
        let reopened = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get("inv1.pdf").await.unwrap().id, b);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn reads_use_the_index_not_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let id = store.upsert(&record("inv1.pdf", "INV-1")).await.unwrap();

        // A record dropped in by someone else is not picked up by a rescan.
        let stray = StoredInvoice::new(record("stray.pdf", "INV-9"));
        std::fs::write(
            dir.path().join(format!("{}.json", stray.id)),
            serde_json::to_vec(&stray).unwrap(),
        )
        .unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["inv1.pdf".to_string()]);

        // A record file removed underneath the store reads as missing.
        std::fs::remove_file(dir.path().join(format!("{id}.json"))).unwrap();
        assert!(store.get("inv1.pdf").await.unwrap_err().is_not_found());

        let reopened = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.list().await.unwrap(), vec!["stray.pdf".to_string()]);
    }

    #[tokio::test]
    async fn unreadable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk.json"), b"{not json").unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.upsert(&record("inv1.pdf", "INV-1")).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["inv1.pdf".to_string()]);
    }
}
