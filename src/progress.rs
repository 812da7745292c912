//! Progress-callback trait for per-page extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the scheduler works through the invoice.
//!
//! The callback is the least invasive integration point: a host can forward
//! events to a channel, a terminal progress bar or a job record without the
//! library knowing how it communicates.
//!
//! # Example
//!
//! ```rust
//! use edgequake_invoice::{ExtractionConfig, ExtractionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct ItemCounter {
//!     items: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for ItemCounter {
//!     fn on_page_complete(&self, page_index: usize, total_pages: usize, item_count: usize) {
//!         self.items.fetch_add(item_count, Ordering::SeqCst);
//!         eprintln!("page {}/{}: {} items", page_index + 1, total_pages, item_count);
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(ItemCounter { items: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the scheduler as it processes each page.
///
/// Page indices are 0-based, matching [`crate::output::PageResult::page_index`].
/// All methods have default no-op implementations.
///
/// # Thread safety
///
/// Pages within a batch run concurrently, so `on_page_start`,
/// `on_page_complete` and `on_page_error` may be called from different
/// threads at once. Protect shared state with `Mutex` or atomics.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once after the document is opened.
    ///
    /// # Arguments
    /// * `total_pages`: number of pages in the invoice
    fn on_run_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called just before a page's first extraction call.
    fn on_page_start(&self, page_index: usize, total_pages: usize) {
        let _ = (page_index, total_pages);
    }

    /// Called when a page's items have been extracted.
    ///
    /// # Arguments
    /// * `item_count`: line items the page contributed
    fn on_page_complete(&self, page_index: usize, total_pages: usize, item_count: usize) {
        let _ = (page_index, total_pages, item_count);
    }

    /// Called when a page fails; it contributes no items.
    fn on_page_error(&self, page_index: usize, total_pages: usize, error: &str) {
        let _ = (page_index, total_pages, error);
    }

    /// Called once after every page has been attempted.
    ///
    /// Not called when the run aborts on a rasterization error.
    fn on_run_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// A no-op implementation, the default when no callback is configured.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
