//! Error types for the edgequake-invoice library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`InvoiceError`]: **fatal**, the run cannot proceed at all (bad input
//!   file, unparseable PDF, provider not configured). Returned as
//!   `Err(InvoiceError)` from the top-level `extract*` functions, with no
//!   partial result.
//!
//! * [`PageError`]: **non-fatal**, one page's extraction failed (upload,
//!   provider error, malformed JSON) but every other page is unaffected.
//!   Stored inside [`crate::output::PageResult`] and absorbed by the
//!   scheduler; the page simply contributes zero items.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-invoice library.
///
/// Page-level failures use [`PageError`] and never surface here, except
/// through [`crate::output::ExtractionOutput::into_result`].
#[derive(Debug, Error)]
pub enum InvoiceError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Invoice file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file is a spreadsheet, word-processor or text document that must
    /// be rendered to PDF before extraction.
    #[error("'{path}' is a {format} document; convert it to PDF before extraction")]
    ConversionRequired { path: PathBuf, format: String },

    /// The file extension is not one we know how to handle at all.
    #[error("Unsupported invoice format '{extension}' for '{path}'\nSupported: .pdf (convert .xlsx, .xls, .doc, .docx, .txt to PDF first)")]
    UnsupportedFormat { path: PathBuf, extension: String },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── Rasterization errors ──────────────────────────────────────────────
    /// The PDF could not be opened or one of its pages could not be
    /// rendered. No partial rasterization is ever used.
    #[error("Rasterization failed for '{path}': {detail}")]
    Rasterization { path: PathBuf, detail: String },

    /// The page stream ended before every page of the document arrived,
    /// e.g. because the render thread died.
    #[error("Rasterization stopped after {rendered} of {expected} pages")]
    IncompleteRasterization { rendered: usize, expected: usize },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install libpdfium for your platform, or point PDFIUM_LIB_PATH at an\n\
existing copy (either the library file or the directory containing it).\n"
    )]
    PdfiumBindingFailed(String),

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Some pages succeeded but at least one failed.
    ///
    /// Returned by [`crate::output::ExtractionOutput::into_result`] when
    /// the caller wants to treat any page failure as an error.
    #[error("{failed}/{total} pages failed during extraction")]
    PartialFailure {
        succeeded: usize,
        failed: usize,
        total: usize,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output JSON file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl InvoiceError {
    /// Whether this error came out of the rasterization stage.
    pub fn is_rasterization(&self) -> bool {
        matches!(
            self,
            InvoiceError::Rasterization { .. }
                | InvoiceError::IncompleteRasterization { .. }
                | InvoiceError::PasswordRequired { .. }
                | InvoiceError::WrongPassword { .. }
                | InvoiceError::PdfiumBindingFailed(_)
        )
    }
}

/// A non-fatal error for a single page.
///
/// Every variant is page-local: the scheduler records it on the page's
/// [`crate::output::PageResult`] and the page contributes zero items.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The page image could not be prepared or handed to the transport.
    #[error("Page {page}: upload failed: {detail}")]
    Upload { page: usize, detail: String },

    /// The provider returned an error, or the call timed out.
    #[error("Page {page}: model call failed: {detail}")]
    Model { page: usize, detail: String },

    /// The response could not be decoded as the requested schema.
    #[error("Page {page}: response did not match the {schema} schema: {detail}")]
    Parse {
        page: usize,
        schema: String,
        detail: String,
    },
}

impl PageError {
    /// 0-based index of the page this error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::Upload { page, .. }
            | PageError::Model { page, .. }
            | PageError::Parse { page, .. } => *page,
        }
    }

    /// Transport-level failures may succeed on a second attempt; a model that
    /// answered with the wrong shape is not retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PageError::Parse { .. })
    }
}
