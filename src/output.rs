//! Batch results: one [`DocumentResult`] per submitted document.

use crate::error::{DocumentError, ErrorKind};
use crate::record::InvoiceRecord;
use crate::store::RecordId;
use serde::{Deserialize, Serialize};

/// What happened to one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocumentOutcome {
    /// Normalised and stored.
    Success { id: RecordId, record: InvoiceRecord },
    /// Failed at some stage; `kind` is the taxonomy name.
    Error { kind: ErrorKind, message: String },
}

impl DocumentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DocumentOutcome::Success { .. })
    }

    /// The stored record, if any.
    pub fn record(&self) -> Option<&InvoiceRecord> {
        match self {
            DocumentOutcome::Success { record, .. } => Some(record),
            DocumentOutcome::Error { .. } => None,
        }
    }

    /// The error kind, if the document failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            DocumentOutcome::Success { .. } => None,
            DocumentOutcome::Error { kind, .. } => Some(*kind),
        }
    }
}

impl From<DocumentError> for DocumentOutcome {
    fn from(e: DocumentError) -> Self {
        DocumentOutcome::Error {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Result for a single document, in input position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentResult {
    /// 0-based position in the submitted batch.
    pub index: usize,
    pub filename: String,
    #[serde(flatten)]
    pub outcome: DocumentOutcome,
    /// Wall-clock time for this document.
    pub duration_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Aggregate statistics for a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total_documents: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Stored records carrying an amount-mismatch annotation.
    pub amount_mismatches: usize,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_duration_ms: u64,
}

/// Complete result of a batch, one entry per input document in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutput {
    pub results: Vec<DocumentResult>,
    pub stats: BatchStats,
}

impl BatchStats {
    /// Tally a finished batch.
    pub fn from_results(results: &[DocumentResult], total_duration_ms: u64) -> Self {
        let succeeded = results.iter().filter(|r| r.outcome.is_success()).count();
        Self {
            total_documents: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            amount_mismatches: results
                .iter()
                .filter_map(|r| r.outcome.record())
                .filter(|rec| rec.has_amount_mismatch())
                .count(),
            total_prompt_tokens: results.iter().map(|r| r.prompt_tokens).sum(),
            total_completion_tokens: results.iter().map(|r| r.completion_tokens).sum(),
            total_duration_ms,
        }
    }
}
