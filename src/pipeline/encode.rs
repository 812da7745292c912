//! Image encoding: `DynamicImage` → PNG, inline base64 or a spooled file.
//!
//! PNG is lossless; compression artefacts on small invoice digits (batch
//! numbers, prices) are exactly what makes a vision model misread them.
//! `detail: "high"` asks GPT-4-class models for the full tile budget so fine
//! print survives.
//!
//! Encoding consumes the page: the raster is dropped as soon as its PNG
//! bytes exist, so a page never holds both at once for longer than needed.

use crate::pipeline::render::RasterPage;
use crate::pipeline::spool::Spool;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// What a transport receives for one page.
#[derive(Debug, Clone)]
pub enum PagePayload {
    /// Base64 PNG carried in the request body.
    Inline(String),
    /// PNG staged in the run's [`Spool`].
    File(PathBuf),
}

impl PagePayload {
    pub fn file_path(&self) -> Option<&PathBuf> {
        match self {
            PagePayload::File(path) => Some(path),
            PagePayload::Inline(_) => None,
        }
    }
}

/// Encode an image as PNG bytes.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Base64-encode PNG bytes.
pub fn png_to_base64(png: &[u8]) -> String {
    let b64 = STANDARD.encode(png);
    debug!("Encoded image → {} bytes base64", b64.len());
    b64
}

/// Wrap a base64 PNG as an image attachment.
pub fn image_data(b64: String) -> ImageData {
    ImageData::new(b64, "image/png").with_detail("high")
}

/// Encode a rasterised page as a base64 PNG ready for the VLM API.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    Ok(image_data(png_to_base64(&encode_png(img)?)))
}

/// Turn a page into its transport payload, consuming the image.
///
/// With a spool the PNG is written to disk; without one it is inlined.
/// Runs on the blocking pool because PNG compression of a 1700 px page is
/// several milliseconds of CPU.
pub async fn prepare_payload(
    page: RasterPage,
    spool: Option<Arc<Spool>>,
) -> Result<PagePayload, String> {
    let page_index = page.page_index;
    tokio::task::spawn_blocking(move || {
        let png = encode_png(&page.image).map_err(|e| format!("PNG encoding failed: {e}"))?;
        drop(page);
        match spool {
            Some(spool) => spool
                .write_page(page_index, &png)
                .map(PagePayload::File)
                .map_err(|e| format!("could not stage page image: {e}")),
            None => Ok(PagePayload::Inline(png_to_base64(&png))),
        }
    })
    .await
    .map_err(|e| format!("encoding task failed: {e}"))?
}
