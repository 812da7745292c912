//! # edgequake-invoice
//!
//! Extract structured line items from multi-page invoices using Vision
//! Language Models (VLMs).
//!
//! ## Why this crate?
//!
//! Invoice tables break across pages, and only the first page usually
//! carries the column headers. Asking a model to read each page on its own
//! produces items whose fields drift between columns from page to page.
//! This crate discovers the headers once, on page 0, and hands them to every
//! later page as fixed context, so all pages are read against the same
//! column layout.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input      resolve local file, URL or bytes; reject non-PDF formats
//!  ├─ 2. Render     lazy page stream via pdfium, bounded width, grayscale
//!  ├─ 3. Headers    page 0 alone: header call, then its item call
//!  ├─ 4. Batches    remaining pages in fixed-size concurrent batches
//!  ├─ 5. Client     rate-limited (calls / 60 s), retried, schema-decoded
//!  └─ 6. Aggregate  {headers, items} + per-page report
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_invoice::{extract_invoice, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from GEMINI_API_KEY / OPENAI_API_KEY / …
//!     let config = ExtractionConfig::builder()
//!         .max_workers(3)
//!         .batch_size(2)
//!         .max_calls_per_minute(15)
//!         .build()?;
//!     let output = extract_invoice("invoice.pdf", &config).await?;
//!     println!("{}", serde_json::to_string_pretty(&output.invoice)?);
//!     eprintln!("{} items from {}/{} pages",
//!         output.stats.total_items,
//!         output.stats.processed_pages,
//!         output.stats.total_pages);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `invoice2json` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-invoice = { version = "0.1", default-features = false }
//! ```
//!
//! ## pdfium
//!
//! Rendering needs a pdfium shared library. Set `PDFIUM_LIB_PATH` to the
//! library file or its directory, or install it on the system library path.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod schema;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder, ItemOrder};
pub use error::{InvoiceError, PageError};
pub use extract::{
    extract_document, extract_from_bytes, extract_invoice, extract_invoice_sync, extract_to_file,
    inspect, write_json,
};
pub use output::{
    DocumentInfo, ExtractionOutput, ExtractionStats, InvoiceData, InvoiceItem, PageReport,
    PageResult, PageStatus,
};
pub use pipeline::rate_limit::{Clock, ManualClock, RateLimiter, TokioClock};
pub use pipeline::render::{RasterPage, RasterizedDocument};
pub use pipeline::transport::{
    LlmTransport, TransportError, VisionRequest, VisionResponse, VisionTransport,
};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use schema::ResponseSchema;
