//! MongoDB-backed store (feature `mongodb`).
//!
//! Records are stored one document per invoice in a single collection, with
//! `filename` as the identity field and the store id in `_id`.
//!
//! Under [`DuplicatePolicy::Replace`] a unique index on `filename` is created
//! on first write, and the upsert resolves the target document in a single
//! `findOneAndUpdate`, so concurrent writers of one filename converge on one
//! document. Updates are sent as `$set` so concurrent updates to different
//! fields do not overwrite each other. Appending history needs a collection
//! without that index.

use super::{apply_set, set_paths, DuplicatePolicy, RecordId, RecordStore, StoredInvoice};
use crate::error::StoreError;
use crate::record::InvoiceRecord;
use async_trait::async_trait;
use mongodb::{
    bson::{self, doc, Bson, Document},
    options::{ClientOptions, FindOneAndUpdateOptions, FindOneOptions, IndexOptions, ReturnDocument},
    Client, Collection, IndexModel,
};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Default database name.
pub const DEFAULT_DATABASE: &str = "invoices";
/// Default collection name.
pub const DEFAULT_COLLECTION: &str = "records";

/// A [`RecordStore`] over a MongoDB collection.
pub struct MongoStore {
    client: Client,
    database: String,
    collection: String,
    policy: DuplicatePolicy,
    indexed: OnceCell<()>,
}

impl MongoStore {
    /// Connect using a MongoDB connection string.
    pub async fn connect(
        url: &str,
        database: Option<String>,
        collection: Option<String>,
    ) -> Result<Self, StoreError> {
        let mut client_options = ClientOptions::parse(url)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to parse MongoDB URL: {}", e)))?;
        client_options.app_name = Some("invoice-extract".to_string());

        let client = Client::with_options(client_options)
            .map_err(|e| StoreError::Backend(format!("Failed to create MongoDB client: {}", e)))?;

        Ok(Self {
            client,
            database: database.unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            collection: collection.unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
            policy: DuplicatePolicy::default(),
            indexed: OnceCell::new(),
        })
    }

    pub fn with_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn collection(&self) -> Collection<Document> {
        self.client
            .database(&self.database)
            .collection(&self.collection)
    }

    async fn latest(&self, filename: &str) -> Result<Option<StoredInvoice>, StoreError> {
        let options = FindOneOptions::builder()
            .sort(doc! { "stored_at": -1 })
            .build();
        let found = self
            .collection()
            .find_one(doc! { "filename": filename }, options)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to find record: {}", e)))?;

        found.map(from_document).transpose()
    }

    /// Create the unique `filename` index once per store handle.
    ///
    /// A collection that already holds duplicates (from appended history)
    /// cannot take the index; that is logged and writes go ahead without it.
    async fn ensure_unique_filename(&self) {
        self.indexed
            .get_or_init(|| async {
                let model = IndexModel::builder()
                    .keys(doc! { "filename": 1 })
                    .options(
                        IndexOptions::builder()
                            .unique(true)
                            .name("filename_unique".to_string())
                            .build(),
                    )
                    .build();
                if let Err(e) = self.collection().create_index(model, None).await {
                    warn!("Failed to create unique filename index: {}", e);
                }
            })
            .await;
    }

    async fn insert(&self, stored: &StoredInvoice) -> Result<(), StoreError> {
        self.collection()
            .insert_one(to_document(stored)?, None)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to insert record: {}", e)))?;
        Ok(())
    }

    /// Insert `stored` unless a document with its filename exists, then
    /// replace that document's body in place. Returns the id written to.
    async fn replace_by_filename(&self, stored: StoredInvoice) -> Result<RecordId, StoreError> {
        let document = to_document(&stored)?;
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .sort(doc! { "stored_at": -1 })
            .projection(doc! { "_id": 1 })
            .build();
        let target = self
            .collection()
            .find_one_and_update(
                doc! { "filename": stored.record.filename.as_str() },
                doc! { "$setOnInsert": document.clone() },
                options,
            )
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to upsert record: {}", e)))?
            .ok_or_else(|| StoreError::Backend("Upsert returned no document".to_string()))?;

        let id = target
            .get_str("_id")
            .map_err(|e| StoreError::Serialization(format!("Failed to read record id: {}", e)))?;
        if id == stored.id.as_str() {
            return Ok(stored.id);
        }

        let mut replacement = document;
        replacement.insert("_id", id);
        self.collection()
            .replace_one(doc! { "_id": id }, replacement, None)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to write record: {}", e)))?;
        Ok(RecordId::from(id))
    }
}

/// `$set` document for already validated dotted paths.
fn set_document(paths: Vec<(String, Value)>) -> Result<Document, StoreError> {
    let mut set = Document::new();
    for (key, value) in paths {
        let value = bson::to_bson(&value)
            .map_err(|e| StoreError::Serialization(format!("Failed to encode update: {}", e)))?;
        set.insert(key, value);
    }
    Ok(set)
}

fn to_document(stored: &StoredInvoice) -> Result<Document, StoreError> {
    bson::to_document(stored)
        .map_err(|e| StoreError::Serialization(format!("Failed to encode record: {}", e)))
}

fn from_document(document: Document) -> Result<StoredInvoice, StoreError> {
    bson::from_document(document)
        .map_err(|e| StoreError::Serialization(format!("Failed to decode record: {}", e)))
}

#[async_trait]
impl RecordStore for MongoStore {
    async fn upsert(&self, record: &InvoiceRecord) -> Result<RecordId, StoreError> {
        let stored = StoredInvoice::new(record.clone());
        let id = match self.policy {
            DuplicatePolicy::Replace => {
                self.ensure_unique_filename().await;
                self.replace_by_filename(stored).await?
            }
            DuplicatePolicy::Append => {
                self.insert(&stored).await?;
                stored.id
            }
        };
        debug!("Stored '{}' as {}", record.filename, id);
        Ok(id)
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let values = self
            .collection()
            .distinct("filename", None, None)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to list records: {}", e)))?;

        Ok(values
            .into_iter()
            .filter_map(|v| match v {
                Bson::String(s) => Some(s),
                _ => None,
            })
            .collect())
    }

    async fn get(&self, filename: &str) -> Result<StoredInvoice, StoreError> {
        self.latest(filename)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                filename: filename.to_string(),
            })
    }

    async fn update(&self, filename: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let stored = self.get(filename).await?;

        // Paths through scalars are rejected here rather than by the server.
        let mut check = stored.record.clone();
        apply_set(&mut check, fields.clone())?;

        let set = set_document(set_paths(fields)?)?;
        if set.is_empty() {
            return Ok(());
        }
        let result = self
            .collection()
            .update_one(doc! { "_id": stored.id.as_str() }, doc! { "$set": set }, None)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to update record: {}", e)))?;

        if result.matched_count == 0 {
            return Err(StoreError::NotFound {
                filename: filename.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_document_keeps_dotted_keys() {
        let paths = vec![
            ("Details.tax_details.pan_id".to_string(), json!("ABCDE1234F")),
            ("total_amount_with_gst".to_string(), json!(118.5)),
        ];
        let set = set_document(paths).unwrap();
        assert_eq!(set.get_str("Details.tax_details.pan_id").unwrap(), "ABCDE1234F");
        assert_eq!(set.get_f64("total_amount_with_gst").unwrap(), 118.5);
    }

    #[test]
    fn stored_invoice_encodes_with_string_id() {
        let fields = json!({"invoice_number": "INV-1"});
        let record = InvoiceRecord::new(
            "inv1.pdf",
            crate::schema::SchemaKind::Flat,
            fields.as_object().unwrap().clone(),
        );
        let stored = StoredInvoice::new(record);
        let document = to_document(&stored).unwrap();
        assert_eq!(document.get_str("_id").unwrap(), stored.id.as_str());
        assert_eq!(document.get_str("filename").unwrap(), "inv1.pdf");
        assert_eq!(from_document(document).unwrap(), stored);
    }
}
