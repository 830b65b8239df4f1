//! Image encoding: page rasters → PNG bytes → base64 `ImageData`.
//!
//! Vision APIs accept images as base64 data URIs embedded in the JSON request
//! body. PNG is lossless; JPEG artefacts on rendered digits are exactly what
//! turns an `8` into a `3` on an invoice total.

use crate::document::RasterImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// PNG-encode a rendered page.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Wrap a page raster as a vision-request attachment.
///
/// `detail: "high"` lets GPT-4-class models tile the full image; with
/// `"low"` the fine print of tax lines is lost.
pub fn page_image_data(page: &RasterImage) -> ImageData {
    let b64 = STANDARD.encode(&page.png);
    debug!("Encoded page {} → {} bytes base64", page.page_index + 1, b64.len());
    ImageData::new(b64, "image/png").with_detail("high")
}
