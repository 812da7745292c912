//! Pipeline stages for invoice line-item extraction.
//!
//! Each submodule implements one step; the scheduler wires them together.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ scheduler ──▶ encode ──▶ llm ──▶ aggregate
//! (path/URL) (pdfium,   (page 0, then  (PNG,     (rate limit,  (headers +
//!            lazy)       batches)      spool)    transport)    items)
//! ```
//!
//! 1. [`input`]     canonicalise the path or URL to a local PDF
//! 2. [`render`]    lazy stream of bounded grayscale page images
//! 3. [`scheduler`] page 0 alone for the header phase, then batches
//! 4. [`encode`]    PNG-encode each page, inline or via the [`spool`]
//! 5. [`llm`]       rate-limited, retried, decoded call per page
//!    through a [`transport`]
//! 6. [`aggregate`] merge page results into the invoice
//!
//! [`headers`] holds the write-once header list; [`repair`] cleans model
//! JSON before decoding.

pub mod aggregate;
pub mod encode;
pub mod headers;
pub mod input;
pub mod llm;
pub mod rate_limit;
pub mod render;
pub mod repair;
pub mod scheduler;
pub mod spool;
pub mod transport;
