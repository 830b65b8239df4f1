//! Record Store Adapter: persists normalised invoices keyed by filename.
//!
//! The core only needs four operations, captured by [`RecordStore`]:
//!
//! | Operation | Miss behaviour |
//! |-----------|----------------|
//! | `upsert(record)` | n/a: inserts, or replaces per [`DuplicatePolicy`] |
//! | `list()` | empty list |
//! | `get(filename)` | [`StoreError::NotFound`] |
//! | `update(filename, fields)` | [`StoreError::NotFound`] |
//!
//! `update` has `$set` semantics: only the named fields change. Keys may be
//! dotted paths (`Details.tax_details.pan_id`) that reach into nested
//! objects, creating intermediate objects as needed. The identity key
//! `filename` and the other reserved keys are never changed by an update.
//!
//! Implementations must tolerate concurrent upserts to distinct filenames;
//! writes to the same filename may race, and the last write wins.

pub mod file;
pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "mongodb")]
pub use mongo::MongoStore;

use crate::error::StoreError;
use crate::record::{InvoiceRecord, RESERVED_KEYS};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Store-assigned identifier of a persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A record as it sits in a store: the invoice plus its storage metadata.
///
/// Serialises to a single flat document (`_id`, `stored_at`, `filename`,
/// `schema`, the schema fields, `annotations`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredInvoice {
    #[serde(rename = "_id")]
    pub id: RecordId,
    pub stored_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: InvoiceRecord,
}

impl StoredInvoice {
    pub fn new(record: InvoiceRecord) -> Self {
        Self {
            id: RecordId::generate(),
            stored_at: Utc::now(),
            record,
        }
    }
}

/// What `upsert` does when a record with the same filename already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Replace the existing record in place, keeping its storage id.
    #[default]
    Replace,
    /// Insert a new record; `get` and `update` then address the latest one.
    Append,
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicatePolicy::Replace => f.write_str("replace"),
            DuplicatePolicy::Append => f.write_str("append"),
        }
    }
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "replace" | "upsert" => Ok(DuplicatePolicy::Replace),
            "append" | "insert" => Ok(DuplicatePolicy::Append),
            other => Err(format!(
                "unknown duplicate policy '{other}' (expected replace or append)"
            )),
        }
    }
}

/// Persistence for normalised invoice records.
///
/// # Example
///
/// ```rust
/// use invoice_extract::{InvoiceRecord, MemoryStore, RecordStore, SchemaKind};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new();
/// let fields = json!({"invoice_number": "INV-1", "pan_id": "N/A"});
/// let record = InvoiceRecord::new("inv1.pdf", SchemaKind::Flat, fields.as_object().unwrap().clone());
/// store.upsert(&record).await.unwrap();
///
/// let fix = json!({"pan_id": "ABCDE1234F"});
/// store.update("inv1.pdf", fix.as_object().unwrap().clone()).await.unwrap();
/// assert_eq!(store.get("inv1.pdf").await.unwrap().record.fields["pan_id"], "ABCDE1234F");
/// # });
/// ```
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a record and return its storage id.
    async fn upsert(&self, record: &InvoiceRecord) -> Result<RecordId, StoreError>;

    /// Every known filename, once each. Order is not guaranteed.
    async fn list(&self) -> Result<Vec<String>, StoreError>;

    /// The record stored under `filename` (the latest, under
    /// [`DuplicatePolicy::Append`]).
    async fn get(&self, filename: &str) -> Result<StoredInvoice, StoreError>;

    /// Set the given fields on the record stored under `filename`.
    async fn update(&self, filename: &str, fields: Map<String, Value>) -> Result<(), StoreError>;
}

/// Apply `$set`-style updates to a record's fields.
///
/// Keys are dotted paths. Reserved top-level keys are skipped with a warning.
/// Fails without modifying the record if any path runs through a value that
/// is not an object.
pub fn apply_set(record: &mut InvoiceRecord, updates: Map<String, Value>) -> Result<(), StoreError> {
    let mut fields = record.fields.clone();
    for (key, value) in set_paths(updates)? {
        if !record.schema.declares(&key) {
            warn!("'{}' is not a {} schema field; setting it anyway", key, record.schema);
        }
        let path: Vec<&str> = key.split('.').collect();
        set_path(&mut fields, &path, value)
            .map_err(|at| StoreError::InvalidUpdate(format!("'{at}' in '{key}' is not an object")))?;
    }
    record.fields = fields;
    Ok(())
}

/// Check update keys and drop the reserved ones.
///
/// Rejects keys with an empty path segment (`a..b`, `.a`).
pub(crate) fn set_paths(updates: Map<String, Value>) -> Result<Vec<(String, Value)>, StoreError> {
    let mut paths = Vec::with_capacity(updates.len());
    for (key, value) in updates {
        if key.split('.').any(|seg| seg.is_empty()) {
            return Err(StoreError::InvalidUpdate(format!("empty segment in '{key}'")));
        }
        let top = key.split('.').next().unwrap_or_default();
        if RESERVED_KEYS.contains(&top) {
            warn!("Ignoring update of reserved key '{}'", key);
            continue;
        }
        paths.push((key, value));
    }
    Ok(paths)
}

fn set_path(fields: &mut Map<String, Value>, path: &[&str], value: Value) -> Result<(), String> {
    let (last, parents) = match path.split_last() {
        Some(split) => split,
        None => return Ok(()),
    };
    let mut cur = fields;
    for seg in parents {
        let next = cur
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        cur = match next {
            Value::Object(map) => map,
            _ => return Err(seg.to_string()),
        };
    }
    cur.insert(last.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaKind;
    use serde_json::json;

    fn record() -> InvoiceRecord {
        let fields = json!({
            "invoice_number": "INV-1",
            "Details": {"tax_details": {"gst_number": "N/A", "pan_id": "N/A"}},
            "items": []
        });
        InvoiceRecord::new("inv1.pdf", SchemaKind::Nested, fields.as_object().unwrap().clone())
    }

    fn updates(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn set_top_level_field() {
        let mut rec = record();
        apply_set(&mut rec, updates(json!({"invoice_number": "INV-2"}))).unwrap();
        assert_eq!(rec.fields["invoice_number"], "INV-2");
        assert_eq!(rec.fields["Details"]["tax_details"]["gst_number"], "N/A");
    }

    #[test]
    fn set_dotted_path_touches_only_leaf() {
        let mut rec = record();
        apply_set(&mut rec, updates(json!({"Details.tax_details.pan_id": "ABCDE1234F"}))).unwrap();
        assert_eq!(rec.fields["Details"]["tax_details"]["pan_id"], "ABCDE1234F");
        assert_eq!(rec.fields["Details"]["tax_details"]["gst_number"], "N/A");
    }

    #[test]
    fn dotted_path_creates_intermediates() {
        let mut rec = record();
        apply_set(&mut rec, updates(json!({"Extra.note": "paid"}))).unwrap();
        assert_eq!(rec.fields["Extra"]["note"], "paid");
    }

    #[test]
    fn filename_cannot_be_changed() {
        let mut rec = record();
        apply_set(&mut rec, updates(json!({"filename": "other.pdf", "_id": "x"}))).unwrap();
        assert_eq!(rec.filename, "inv1.pdf");
        assert!(!rec.fields.contains_key("filename"));
        assert!(!rec.fields.contains_key("_id"));
    }

    #[test]
    fn path_through_scalar_is_rejected_atomically() {
        let mut rec = record();
        let before = rec.clone();
        let err = apply_set(
            &mut rec,
            updates(json!({"invoice_number": "INV-9", "invoice_number.part": 1})),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidUpdate(_)));
        assert_eq!(rec, before);
    }

    #[test]
    fn set_paths_filters_reserved_and_rejects_empty_segments() {
        let paths = set_paths(updates(json!({"schema": "nested", "Details.pan": "P"}))).unwrap();
        assert_eq!(paths, vec![("Details.pan".to_string(), json!("P"))]);

        let err = set_paths(updates(json!({"Details..pan": "P"}))).unwrap_err();
        assert!(matches!(err, StoreError::InvalidUpdate(_)));
    }

    #[test]
    fn stored_invoice_is_one_flat_document() {
        let stored = StoredInvoice::new(record());
        let v = serde_json::to_value(&stored).unwrap();
        assert_eq!(v["filename"], "inv1.pdf");
        assert_eq!(v["invoice_number"], "INV-1");
        assert!(v["_id"].is_string());
        assert!(v["stored_at"].is_string());

        let back: StoredInvoice = serde_json::from_value(v).unwrap();
        assert_eq!(back, stored);
    }

    #[test]
    fn duplicate_policy_parses() {
        assert_eq!("append".parse::<DuplicatePolicy>().unwrap(), DuplicatePolicy::Append);
        assert_eq!("Replace".parse::<DuplicatePolicy>().unwrap(), DuplicatePolicy::Replace);
        assert!("keep".parse::<DuplicatePolicy>().is_err());
        assert_eq!(DuplicatePolicy::default(), DuplicatePolicy::Replace);
    }
}
