//! Error types for the invoice-extract library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`InvoiceError`]: **fatal**. The batch cannot proceed at all (no
//!   documents supplied, provider not configured, invalid configuration).
//!   Returned as `Err(InvoiceError)` from the top-level batch functions.
//!
//! * [`DocumentError`]: **non-fatal**. A single document failed (wrong file
//!   type, corrupt PDF, inference call failed, completion not JSON) but the
//!   other documents in the batch are unaffected. Stored inside
//!   [`crate::output::DocumentOutcome`] so callers see one entry per input.
//!
//! * [`StoreError`]: a record store operation failed. `NotFound` is the
//!   expected miss on `get`/`update`; the rest are backend failures that are
//!   reported to the caller and never retried internally.
//!
//! A sum/total disagreement is not an error at all: it is recorded as
//! [`crate::record::RecordAnnotation::AmountMismatch`] on a persisted record.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// All fatal errors returned by the invoice-extract library.
#[derive(Debug, Error)]
pub enum InvoiceError {
    /// The batch request carried no documents.
    #[error("No documents supplied: a batch needs at least one document")]
    NoDocuments,

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured inference provider is not initialised (missing API key etc.).
    #[error("Inference provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// A source could not be loaded (path missing, download failed).
    #[error("Failed to load '{source_ref}': {reason}")]
    SourceUnavailable { source_ref: String, reason: String },

    /// A record store operation failed outside of per-document processing.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A non-fatal error for a single document in a batch.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum DocumentError {
    /// The upload is not an accepted document type. Nothing was rendered.
    #[error("Invalid file type '{filename}': only PDF documents are supported")]
    InvalidFileType { filename: String },

    /// The document could not be opened, read or rasterised.
    #[error("Could not render '{filename}': {detail}")]
    RenderError { filename: String, detail: String },

    /// The inference call failed or timed out.
    #[error("Inference unavailable for '{filename}': {detail}")]
    InferenceUnavailable { filename: String, detail: String },

    /// The completion could not be parsed as a JSON invoice object.
    #[error("Malformed response for '{filename}': {detail}")]
    MalformedResponse { filename: String, detail: String },

    /// The normalised record could not be persisted.
    #[error("Could not store '{filename}': {detail}")]
    StoreFailed { filename: String, detail: String },
}

impl DocumentError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DocumentError::InvalidFileType { .. } => ErrorKind::InvalidFileType,
            DocumentError::RenderError { .. } => ErrorKind::RenderError,
            DocumentError::InferenceUnavailable { .. } => ErrorKind::InferenceUnavailable,
            DocumentError::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            DocumentError::StoreFailed { .. } => ErrorKind::StoreFailed,
        }
    }

    /// The filename of the document that failed.
    pub fn filename(&self) -> &str {
        match self {
            DocumentError::InvalidFileType { filename }
            | DocumentError::RenderError { filename, .. }
            | DocumentError::InferenceUnavailable { filename, .. }
            | DocumentError::MalformedResponse { filename, .. }
            | DocumentError::StoreFailed { filename, .. } => filename,
        }
    }
}

/// Error taxonomy surfaced to transport callers as `{kind, message}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidFileType,
    RenderError,
    InferenceUnavailable,
    MalformedResponse,
    StoreFailed,
    NotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidFileType => "InvalidFileType",
            ErrorKind::RenderError => "RenderError",
            ErrorKind::InferenceUnavailable => "InferenceUnavailable",
            ErrorKind::MalformedResponse => "MalformedResponse",
            ErrorKind::StoreFailed => "StoreFailed",
            ErrorKind::NotFound => "NotFound",
        };
        f.write_str(s)
    }
}

/// A failed inference call, as reported by a [`crate::pipeline::llm::InferenceBackend`].
///
/// Carries the transport or service message only; the orchestrator attaches
/// the filename when converting it to [`DocumentError::InferenceUnavailable`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct InferenceError(pub String);

/// Errors returned by [`crate::store::RecordStore`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record has the requested filename.
    #[error("Invoice not found: '{filename}'")]
    NotFound { filename: String },

    /// A record could not be converted to or from its persisted layout.
    #[error("Record serialisation failed: {0}")]
    Serialization(String),

    /// Filesystem failure in a file-backed store.
    #[error("Store I/O error at '{path}': {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An update could not be applied (e.g. a dotted path runs through a
    /// non-object value).
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    /// Backend (database) failure.
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns `true` for a lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        if self.is_not_found() {
            ErrorKind::NotFound
        } else {
            ErrorKind::StoreFailed
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_file_type_display() {
        let e = DocumentError::InvalidFileType {
            filename: "notes.txt".into(),
        };
        assert!(e.to_string().contains("notes.txt"));
        assert_eq!(e.kind(), ErrorKind::InvalidFileType);
        assert_eq!(e.filename(), "notes.txt");
    }

    #[test]
    fn malformed_response_display() {
        let e = DocumentError::MalformedResponse {
            filename: "inv1.pdf".into(),
            detail: "expected value at line 1 column 1".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("inv1.pdf"), "got: {msg}");
        assert!(msg.contains("line 1"), "got: {msg}");
    }

    #[test]
    fn kind_serialises_with_taxonomy_name() {
        let json = serde_json::to_string(&ErrorKind::InferenceUnavailable).unwrap();
        assert_eq!(json, "\"InferenceUnavailable\"");
        assert_eq!(ErrorKind::NotFound.to_string(), "NotFound");
    }

    #[test]
    fn store_not_found_kind() {
        let e = StoreError::NotFound {
            filename: "x.pdf".into(),
        };
        assert!(e.is_not_found());
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(StoreError::Backend("down".into()).kind(), ErrorKind::StoreFailed);
    }

    #[test]
    fn store_error_converts_into_fatal() {
        let e: InvoiceError = StoreError::Backend("connection refused".into()).into();
        assert!(e.to_string().contains("connection refused"));
    }
}
