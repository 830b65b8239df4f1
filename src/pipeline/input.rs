//! Input resolution: turn a user-supplied path or URL into a [`SourceDocument`].
//!
//! Documents are held in memory from here on; pdfium opens them straight
//! from the byte buffer, so nothing is written to disk. The accepted-type
//! check lives here as well because it must run before any rendering.

use crate::document::{SourceDocument, PDF_MEDIA_TYPE};
use crate::error::InvoiceError;
use std::path::Path;
use tracing::{debug, info};

/// The only accepted document extension.
pub const ACCEPTED_EXTENSION: &str = "pdf";

/// `true` when the filename carries the accepted extension (case-insensitive).
pub fn is_supported(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ACCEPTED_EXTENSION))
}

/// `true` when the bytes start with the PDF magic `%PDF`.
pub fn has_pdf_magic(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF")
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Load a document from a local path or an HTTP(S) URL.
pub async fn load_source(input: &str, timeout_secs: u64) -> Result<SourceDocument, InvoiceError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        load_path(Path::new(input)).await
    }
}

/// Read a local file. The document keeps the file's base name.
pub async fn load_path(path: &Path) -> Result<SourceDocument, InvoiceError> {
    let unavailable = |reason: String| InvoiceError::SourceUnavailable {
        source_ref: path.display().to_string(),
        reason,
    };

    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => unavailable("file not found".to_string()),
        std::io::ErrorKind::PermissionDenied => unavailable("permission denied".to_string()),
        _ => unavailable(e.to_string()),
    })?;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| unavailable("path has no file name".to_string()))?;

    debug!("Loaded {} ({} bytes)", path.display(), bytes.len());
    Ok(SourceDocument::from_bytes(filename, bytes))
}

/// Download a URL into memory.
async fn download_url(url: &str, timeout_secs: u64) -> Result<SourceDocument, InvoiceError> {
    info!("Downloading document from: {}", url);

    let failed = |reason: String| InvoiceError::SourceUnavailable {
        source_ref: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {}s", timeout_secs))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let is_pdf = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with(PDF_MEDIA_TYPE));
    let filename = filename_from_url(url, is_pdf);

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    info!("Downloaded {} ({} bytes)", filename, bytes.len());
    Ok(SourceDocument::from_bytes(filename, bytes.to_vec()))
}

/// Last path segment of the URL. A PDF served under an extension-less name
/// gets `.pdf` appended so the accepted-type check sees what it is.
fn filename_from_url(url: &str, is_pdf: bool) -> String {
    let last = reqwest::Url::parse(url).ok().and_then(|parsed| {
        parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .filter(|s| !s.is_empty())
    });

    match last {
        Some(name) if name.contains('.') => name,
        Some(name) if is_pdf => format!("{name}.{ACCEPTED_EXTENSION}"),
        Some(name) => name,
        None => format!("downloaded.{ACCEPTED_EXTENSION}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn accepted_extension_case_insensitive() {
        assert!(is_supported("inv1.pdf"));
        assert!(is_supported("SCAN.PDF"));
        assert!(is_supported("a.b.Pdf"));
        assert!(!is_supported("notes.txt"));
        assert!(!is_supported("pdf"));
        assert!(!is_supported("invoice.pdf.zip"));
    }

    #[test]
    fn pdf_magic() {
        assert!(has_pdf_magic(b"%PDF-1.7\n..."));
        assert!(!has_pdf_magic(b"PK\x03\x04"));
        assert!(!has_pdf_magic(b""));
    }

    #[test]
    fn filename_from_url_segments() {
        assert_eq!(filename_from_url("https://x.test/a/inv9.pdf", false), "inv9.pdf");
        assert_eq!(filename_from_url("https://x.test/get/42", true), "42.pdf");
        assert_eq!(filename_from_url("https://x.test/get/42", false), "42");
        assert_eq!(filename_from_url("https://x.test/", true), "downloaded.pdf");
    }

    #[tokio::test]
    async fn load_path_keeps_base_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inv1.pdf");
        std::fs::write(&path, b"%PDF-1.4 test").unwrap();

        let doc = load_path(&path).await.unwrap();
        assert_eq!(doc.filename(), "inv1.pdf");
        assert_eq!(doc.media_type(), PDF_MEDIA_TYPE);
        assert_eq!(doc.bytes(), b"%PDF-1.4 test");
    }

    #[tokio::test]
    async fn load_path_missing_file() {
        let err = load_source("/definitely/not/here.pdf", 5).await.unwrap_err();
        assert!(
            matches!(err, InvoiceError::SourceUnavailable { ref reason, .. } if reason == "file not found"),
            "{err:?}"
        );
    }
}
