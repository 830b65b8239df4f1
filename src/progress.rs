//! Progress-callback trait for per-document batch events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the orchestrator works through a batch. Callers can forward
//! them to a channel, a WebSocket or a terminal progress bar without the
//! library knowing how the host application communicates.
//!
//! # Example
//!
//! ```rust
//! use invoice_extract::{BatchProgressCallback, ExtractionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     stored: AtomicUsize,
//! }
//!
//! impl BatchProgressCallback for CountingCallback {
//!     fn on_document_complete(&self, index: usize, total: usize, filename: &str) {
//!         let done = self.stored.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{}/{} stored: {} ({} done)", index + 1, total, filename, done);
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { stored: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the batch orchestrator as it processes each document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. `index` is the 0-based position in the batch.
///
/// # Thread safety
///
/// With `concurrency > 1` the per-document methods may be called
/// concurrently from different tasks. Implementations must protect shared
/// mutable state (e.g. `Mutex`, `AtomicUsize`).
pub trait BatchProgressCallback: Send + Sync {
    /// Called once before any document is processed.
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called before a document is rendered.
    fn on_document_start(&self, index: usize, total: usize, filename: &str) {
        let _ = (index, total, filename);
    }

    /// Called when a document's record has been stored.
    fn on_document_complete(&self, index: usize, total: usize, filename: &str) {
        let _ = (index, total, filename);
    }

    /// Called when a document failed at any stage.
    fn on_document_error(&self, index: usize, total: usize, filename: &str, error: &str) {
        let _ = (index, total, filename, error);
    }

    /// Called once after every document has been attempted.
    fn on_batch_complete(&self, total: usize, success_count: usize) {
        let _ = (total, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        success_total: AtomicUsize,
    }

    impl BatchProgressCallback for TrackingCallback {
        fn on_document_start(&self, _index: usize, _total: usize, _filename: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_document_complete(&self, _index: usize, _total: usize, _filename: &str) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_document_error(&self, _index: usize, _total: usize, _filename: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_batch_complete(&self, _total: usize, success_count: usize) {
            self.success_total.store(success_count, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_batch_start(2);
        cb.on_document_start(0, 2, "a.pdf");
        cb.on_document_complete(0, 2, "a.pdf");
        cb.on_document_error(1, 2, "b.txt", "Invalid file type");
        cb.on_batch_complete(2, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_batch_start(3);
        tracker.on_document_start(0, 3, "a.pdf");
        tracker.on_document_complete(0, 3, "a.pdf");
        tracker.on_document_start(1, 3, "b.pdf");
        tracker.on_document_error(1, 3, "b.pdf", "timeout");
        tracker.on_batch_complete(3, 1);

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.success_total.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(10);
    }
}
