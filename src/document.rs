//! Source documents and their rendered forms.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Media type declared for PDF uploads.
pub const PDF_MEDIA_TYPE: &str = "application/pdf";

/// One uploaded document: raw bytes plus the name it was uploaded under.
///
/// Immutable after ingestion; the batch owns it for the duration of one request.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceDocument {
    filename: String,
    media_type: String,
    bytes: Vec<u8>,
}

impl SourceDocument {
    /// Create a document with an explicit media type.
    pub fn new(
        filename: impl Into<String>,
        media_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            filename: filename.into(),
            media_type: media_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Create a document whose media type is guessed from the filename.
    pub fn from_bytes(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let filename = filename.into();
        let media_type = media_type_for(&filename).to_string();
        Self::new(filename, media_type, bytes)
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for SourceDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDocument")
            .field("filename", &self.filename)
            .field("media_type", &self.media_type)
            .field("bytes", &format_args!("<{} bytes>", self.bytes.len()))
            .finish()
    }
}

fn media_type_for(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".pdf") {
        PDF_MEDIA_TYPE
    } else if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".txt") {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}

/// How a document is reduced before inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Extract the embedded text layer, page by page. Cheap; loses
    /// information on scanned or handwritten invoices.
    #[default]
    Text,
    /// Rasterise every page to PNG and send the images to a vision model.
    Vision,
}

/// One rasterised page, PNG-encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct RasterImage {
    /// 0-based page index in the source document.
    pub page_index: usize,
    pub width: u32,
    pub height: u32,
    /// PNG bytes.
    pub png: Vec<u8>,
}

impl fmt::Debug for RasterImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasterImage")
            .field("page_index", &self.page_index)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("png", &format_args!("<{} bytes>", self.png.len()))
            .finish()
    }
}

/// A document reduced to what the inference capability consumes.
///
/// Exactly one variant is produced per document per [`ExtractionMode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedContent {
    /// Per-page text concatenated in page order.
    Text(String),
    /// Page images in page order.
    Pages(Vec<RasterImage>),
}

impl RenderedContent {
    /// Number of bytes (text) or pages (images), for logging.
    pub fn size_hint(&self) -> usize {
        match self {
            RenderedContent::Text(t) => t.len(),
            RenderedContent::Pages(p) => p.len(),
        }
    }

    /// True when there is nothing to send to the model.
    pub fn is_empty(&self) -> bool {
        match self {
            RenderedContent::Text(t) => t.trim().is_empty(),
            RenderedContent::Pages(p) => p.is_empty(),
        }
    }
}
