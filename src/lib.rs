//! # invoice-extract
//!
//! Turn invoice PDFs into validated, structured JSON records using language
//! and vision models.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input      local file or HTTP(S) download; PDF-only check
//!  ├─ 2. Render     text layer or page PNGs via pdfium (spawn_blocking)
//!  ├─ 3. Infer      one call per document: content + schema contract
//!  ├─ 4. Normalise  recover JSON, conform to schema, merge, cross-check
//!  └─ 5. Store      upsert by filename; list / get / update later
//! ```
//!
//! Every document in a batch gets its own outcome: a stored record or a
//! structured `{kind, message}` error. One bad document never aborts the
//! others.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use invoice_extract::{load_sources, process_batch, ExtractionConfig, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = ExtractionConfig::default();
//!     let store = MemoryStore::new();
//!     let docs = load_sources(&["inv1.pdf".to_string()], 120).await?;
//!     let output = process_batch(docs, &config, &store).await?;
//!     println!("{}", serde_json::to_string_pretty(&output)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature   | Default | Description |
//! |-----------|---------|-------------|
//! | `cli`     | on      | Enables the `invoice-extract` binary (clap + anyhow + tracing-subscriber) |
//! | `mongodb` | off     | Enables [`store::MongoStore`] |
//!
//! ## Schema Families
//!
//! | Schema | Sentinel | Shape |
//! |--------|----------|-------|
//! | `flat` | `N/A` | top-level fields plus `items` |
//! | `nested` | `N/A` | `Details` (with `tax_details`) plus `purchase_details.items` |
//! | `confidence_annotated` | `""` | top-level blocks plus `line_items`, every leaf `{value, conf}` |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod config;
pub mod document;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod record;
pub mod schema;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{load_sources, process_batch};
pub use config::{ExtractionConfig, ExtractionConfigBuilder, ExtractionMode};
pub use document::{RenderedContent, SourceDocument};
pub use error::{DocumentError, ErrorKind, InvoiceError, StoreError};
pub use output::{BatchOutput, BatchStats, DocumentOutcome, DocumentResult};
pub use pipeline::llm::{InferenceBackend, InferenceResponse};
pub use pipeline::render::DocumentRenderer;
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use record::{InvoiceRecord, RecordAnnotation};
pub use schema::SchemaKind;
pub use store::{DuplicatePolicy, FileStore, MemoryStore, RecordId, RecordStore, StoredInvoice};
