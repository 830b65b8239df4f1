//! Pipeline stages for invoice extraction.
//!
//! Each submodule implements exactly one transformation step, so each is
//! independently testable and the rendering or inference backend can be
//! swapped without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ llm ──▶ normalize ──▶ (store)
//! (path/URL) (pdfium)  (model)  (coerce, merge, cross-check)
//! ```
//!
//! 1. [`input`]: load a path or URL into a `SourceDocument` and check the
//!    accepted file type
//! 2. [`render`]: text layer or page rasters; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 3. [`encode`]: PNG-encode and base64-wrap page rasters for vision requests
//! 4. [`llm`]: one at-most-once inference call per document; the only stage
//!    with network I/O
//! 5. [`normalize`]: parse, conform to the schema, merge and cross-check,
//!    built on the leaf rules in [`coerce`] and the grouping pass in [`merge`]

pub mod coerce;
pub mod encode;
pub mod input;
pub mod llm;
pub mod merge;
pub mod normalize;
pub mod render;
