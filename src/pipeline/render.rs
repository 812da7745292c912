//! PDF rasterisation: a lazy stream of bounded page images via pdfium.
//!
//! ## Why a stream?
//!
//! A 40-page invoice rendered at 1700 px wide is several hundred megabytes of
//! pixels. The scheduler only ever needs one batch at a time, so pages are
//! rendered on demand: a blocking thread owns the pdfium document and pushes
//! each page through a channel of capacity one. When the channel is full the
//! renderer waits, which keeps at most one rendered page ahead of the
//! consumer.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state and CPU-heavy rendering.
//! It lives entirely on one blocking-pool thread; only finished
//! `DynamicImage`s cross into async code.
//!
//! A page that fails to render ends the stream with an error. The scheduler
//! treats that as fatal: no partial rasterisation is ever used.

use crate::config::ExtractionConfig;
use crate::error::InvoiceError;
use crate::output::DocumentInfo;
use futures::Stream;
use image::imageops::FilterType;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

/// One rendered page, owned by whoever holds it.
#[derive(Debug, Clone)]
pub struct RasterPage {
    /// 0-based index in the document.
    pub page_index: usize,
    pub image: DynamicImage,
}

/// Pages in document order. Not restartable.
pub type PageStream = Pin<Box<dyn Stream<Item = Result<RasterPage, InvoiceError>> + Send>>;

/// An opened document whose pages have not necessarily been rendered yet.
pub struct RasterizedDocument {
    pub page_count: usize,
    pub pages: PageStream,
}

impl std::fmt::Debug for RasterizedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterizedDocument")
            .field("page_count", &self.page_count)
            .finish_non_exhaustive()
    }
}

impl RasterizedDocument {
    /// Wrap any page source, e.g. an image directory or a test fixture.
    pub fn new<S>(page_count: usize, pages: S) -> Self
    where
        S: Stream<Item = Result<RasterPage, InvoiceError>> + Send + 'static,
    {
        Self {
            page_count,
            pages: Box::pin(pages),
        }
    }

    /// A document from images already in memory.
    pub fn from_images(images: Vec<DynamicImage>) -> Self {
        let page_count = images.len();
        let pages = images
            .into_iter()
            .enumerate()
            .map(|(page_index, image)| Ok(RasterPage { page_index, image }));
        Self::new(page_count, futures::stream::iter(pages))
    }
}

/// Downscale to `max_width` (aspect ratio kept) and optionally drop colour.
pub fn bound_image(image: DynamicImage, max_width: u32, grayscale: bool) -> DynamicImage {
    let image = if image.width() > max_width {
        let height = ((image.height() as u64 * max_width as u64) / image.width() as u64).max(1);
        image.resize(max_width, height as u32, FilterType::Triangle)
    } else {
        image
    };
    if grayscale {
        DynamicImage::ImageLuma8(image.to_luma8())
    } else {
        image
    }
}

/// Bind to pdfium: `PDFIUM_LIB_PATH` (file or directory) first, then the
/// system library search path.
pub(crate) fn bind_pdfium() -> Result<Pdfium, InvoiceError> {
    let bindings = match std::env::var_os("PDFIUM_LIB_PATH") {
        Some(raw) => {
            let path = PathBuf::from(raw);
            let lib = if path.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&path)
            } else {
                path
            };
            debug!("Binding pdfium from {}", lib.display());
            Pdfium::bind_to_library(&lib)
        }
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| InvoiceError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

fn load_error(path: &Path, password: Option<&str>, e: PdfiumError) -> InvoiceError {
    let err_str = format!("{:?}", e);
    if err_str.contains("Password") || err_str.contains("password") {
        if password.is_some() {
            InvoiceError::WrongPassword {
                path: path.to_path_buf(),
            }
        } else {
            InvoiceError::PasswordRequired {
                path: path.to_path_buf(),
            }
        }
    } else {
        InvoiceError::Rasterization {
            path: path.to_path_buf(),
            detail: err_str,
        }
    }
}

struct RenderSettings {
    max_width: u32,
    max_height: u32,
    grayscale: bool,
    password: Option<String>,
}

/// Open a PDF and return a lazy stream of its pages.
///
/// Errors opening the document are returned here; errors rendering a page
/// arrive as the stream's last item.
pub async fn rasterize(
    pdf_path: &Path,
    config: &ExtractionConfig,
) -> Result<RasterizedDocument, InvoiceError> {
    let path = pdf_path.to_path_buf();
    let settings = RenderSettings {
        max_width: config.max_image_width,
        max_height: config.max_image_height,
        grayscale: config.grayscale,
        password: config.password.clone(),
    };

    let (count_tx, count_rx) = oneshot::channel();
    let (page_tx, page_rx) = mpsc::channel(1);

    tokio::task::spawn_blocking(move || render_blocking(&path, settings, count_tx, page_tx));

    let page_count = count_rx
        .await
        .map_err(|_| InvoiceError::Internal("Render task ended before opening the PDF".into()))??;

    Ok(RasterizedDocument::new(
        page_count,
        ReceiverStream::new(page_rx),
    ))
}

/// Runs on the blocking pool for the lifetime of the stream.
fn render_blocking(
    path: &Path,
    settings: RenderSettings,
    count_tx: oneshot::Sender<Result<usize, InvoiceError>>,
    page_tx: mpsc::Sender<Result<RasterPage, InvoiceError>>,
) {
    let pdfium = match bind_pdfium() {
        Ok(p) => p,
        Err(e) => {
            let _ = count_tx.send(Err(e));
            return;
        }
    };

    let password = settings.password.as_deref();
    let document = match pdfium.load_pdf_from_file(path, password) {
        Ok(d) => d,
        Err(e) => {
            let _ = count_tx.send(Err(load_error(path, password, e)));
            return;
        }
    };

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages", total_pages);
    if count_tx.send(Ok(total_pages)).is_err() {
        return;
    }

    let render_config = PdfRenderConfig::new()
        .set_target_width(settings.max_width as i32)
        .set_maximum_height(settings.max_height as i32);

    for idx in 0..total_pages {
        let rendered = render_page(&pages, idx, &render_config).map_err(|e| {
            InvoiceError::Rasterization {
                path: path.to_path_buf(),
                detail: format!("page {}: {:?}", idx + 1, e),
            }
        });

        let item = rendered.map(|image| {
            let image = bound_image(image, settings.max_width, settings.grayscale);
            debug!(
                "Rendered page {} → {}x{} px",
                idx + 1,
                image.width(),
                image.height()
            );
            RasterPage {
                page_index: idx,
                image,
            }
        });

        let failed = item.is_err();
        // The receiver is gone once the run has ended or aborted.
        if page_tx.blocking_send(item).is_err() || failed {
            return;
        }
    }
}

fn render_page(
    pages: &PdfPages,
    idx: usize,
    render_config: &PdfRenderConfig,
) -> Result<DynamicImage, PdfiumError> {
    let page = pages.get(idx as u16)?;
    let bitmap = page.render_with_config(render_config)?;
    Ok(bitmap.as_image())
}

/// Document facts without rendering any page.
pub async fn inspect(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<DocumentInfo, InvoiceError> {
    let path = pdf_path.to_path_buf();
    let pwd = password.map(|s| s.to_string());

    tokio::task::spawn_blocking(move || inspect_blocking(&path, pwd.as_deref()))
        .await
        .map_err(|e| InvoiceError::Internal(format!("Inspect task panicked: {}", e)))?
}

fn inspect_blocking(pdf_path: &Path, password: Option<&str>) -> Result<DocumentInfo, InvoiceError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| load_error(pdf_path, password, e))?;

    let metadata = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata.get(tag).and_then(|t| {
            let v = t.value().trim().to_string();
            (!v.is_empty()).then_some(v)
        })
    };

    Ok(DocumentInfo {
        page_count: document.pages().len() as usize,
        title: get_meta(PdfDocumentMetadataTagType::Title),
        author: get_meta(PdfDocumentMetadataTagType::Author),
        creator: get_meta(PdfDocumentMetadataTagType::Creator),
        producer: get_meta(PdfDocumentMetadataTagType::Producer),
        pdf_version: format!("{:?}", document.version()),
    })
}
