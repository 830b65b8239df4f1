//! Document rendering: PDF bytes → text layer or page rasters via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! [`render_document`] moves the work onto tokio's blocking pool so the
//! worker threads keep driving inference calls for other documents.
//!
//! ## Why cap pixels as well as DPI?
//!
//! Page sizes vary wildly: an A0 sheet at 300 DPI would produce a
//! 9,900 × 14,000 px image. `max_rendered_pixels` caps the longest edge
//! regardless of physical size, keeping memory bounded and staying within
//! what vision models accept.

use crate::document::{ExtractionMode, RasterImage, RenderedContent, SourceDocument};
use crate::error::DocumentError;
use crate::pipeline::encode::encode_png;
use crate::pipeline::input::{has_pdf_magic, is_supported};
use pdfium_render::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Turns one document into [`RenderedContent`].
///
/// Implementations are blocking; [`render_document`] runs them off the
/// async workers.
pub trait DocumentRenderer: Send + Sync {
    fn render(
        &self,
        document: &SourceDocument,
        mode: ExtractionMode,
    ) -> Result<RenderedContent, DocumentError>;
}

/// Run a renderer inside `spawn_blocking`.
pub async fn render_document(
    renderer: Arc<dyn DocumentRenderer>,
    document: Arc<SourceDocument>,
    mode: ExtractionMode,
) -> Result<RenderedContent, DocumentError> {
    let filename = document.filename().to_string();
    tokio::task::spawn_blocking(move || renderer.render(&document, mode))
        .await
        .map_err(|e| DocumentError::RenderError {
            filename,
            detail: format!("render task panicked: {}", e),
        })?
}

/// pdfium-backed renderer.
#[derive(Debug, Clone)]
pub struct PdfiumRenderer {
    dpi: u32,
    max_rendered_pixels: u32,
    password: Option<String>,
    library_path: Option<PathBuf>,
}

impl PdfiumRenderer {
    pub fn new(dpi: u32, max_rendered_pixels: u32) -> Self {
        Self {
            dpi,
            max_rendered_pixels,
            password: None,
            library_path: None,
        }
    }

    /// Password for encrypted documents.
    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// Directory holding the pdfium shared library. Without it the current
    /// directory and then the system library paths are searched.
    pub fn with_library_path(mut self, path: Option<PathBuf>) -> Self {
        self.library_path = path;
        self
    }

    fn bind(&self) -> Result<Pdfium, String> {
        let bindings = match &self.library_path {
            Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)),
            None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                .or_else(|_| Pdfium::bind_to_system_library()),
        }
        .map_err(|e| format!("failed to load the pdfium library: {:?}", e))?;
        Ok(Pdfium::new(bindings))
    }

    fn render_config(&self) -> PdfRenderConfig {
        let max = self.max_rendered_pixels as i32;
        PdfRenderConfig::new()
            .scale_page_by_factor(self.dpi as f32 / 72.0)
            .set_maximum_width(max)
            .set_maximum_height(max)
    }
}

impl DocumentRenderer for PdfiumRenderer {
    fn render(
        &self,
        document: &SourceDocument,
        mode: ExtractionMode,
    ) -> Result<RenderedContent, DocumentError> {
        let filename = document.filename();
        if !is_supported(filename) {
            return Err(DocumentError::InvalidFileType {
                filename: filename.to_string(),
            });
        }
        let render_error = |detail: String| DocumentError::RenderError {
            filename: filename.to_string(),
            detail,
        };

        if !has_pdf_magic(document.bytes()) {
            return Err(render_error("not a PDF (missing %PDF header)".to_string()));
        }

        let pdfium = self.bind().map_err(render_error)?;
        let password = self.password.as_deref();
        let pdf = pdfium
            .load_pdf_from_byte_slice(document.bytes(), password)
            .map_err(|e| {
                let err_str = format!("{:?}", e);
                if err_str.contains("Password") || err_str.contains("password") {
                    if password.is_some() {
                        render_error("wrong password".to_string())
                    } else {
                        render_error("document is password-protected".to_string())
                    }
                } else {
                    render_error(err_str)
                }
            })?;

        let pages = pdf.pages();
        info!("{}: {} pages, {:?} mode", filename, pages.len(), mode);

        match mode {
            ExtractionMode::Text => {
                let mut text = String::new();
                for (idx, page) in pages.iter().enumerate() {
                    let page_text = page
                        .text()
                        .map_err(|e| render_error(format!("page {}: {:?}", idx + 1, e)))?;
                    text.push_str(&page_text.all());
                }
                debug!("{}: extracted {} chars of text", filename, text.len());
                Ok(RenderedContent::Text(text))
            }
            ExtractionMode::Vision => {
                let config = self.render_config();
                let mut rasters = Vec::with_capacity(pages.len() as usize);
                for (idx, page) in pages.iter().enumerate() {
                    let image = page
                        .render_with_config(&config)
                        .map_err(|e| render_error(format!("page {}: {:?}", idx + 1, e)))?
                        .as_image();
                    let png = encode_png(&image)
                        .map_err(|e| render_error(format!("page {}: {}", idx + 1, e)))?;
                    debug!(
                        "{}: rendered page {} → {}x{} px",
                        filename,
                        idx + 1,
                        image.width(),
                        image.height()
                    );
                    rasters.push(RasterImage {
                        page_index: idx,
                        width: image.width(),
                        height: image.height(),
                        png,
                    });
                }
                Ok(RenderedContent::Pages(rasters))
            }
        }
    }
}
