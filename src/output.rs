//! Result types: the extracted invoice and the per-page report around it.
//!
//! [`InvoiceData`] is the value handed to downstream serialisers (JSON, CSV)
//! and has exactly two fields. Everything about *how* the run went (which
//! pages failed, how long the rate limiter held us back, token usage) lives
//! beside it in [`ExtractionOutput`] so the invoice shape never changes.

use crate::error::{InvoiceError, PageError};
use crate::schema::{lenient_quantity, lenient_text};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One product line on an invoice.
///
/// Any field the model could not read is `None`, serialised as `null`; all
/// five keys are always present in the JSON form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct InvoiceItem {
    /// The name of the product.
    #[serde(default, deserialize_with = "lenient_text")]
    #[schemars(with = "Option<String>")]
    pub product_name: Option<String>,

    /// The batch number of the product.
    #[serde(default, deserialize_with = "lenient_text")]
    #[schemars(with = "Option<String>")]
    pub batch_number: Option<String>,

    /// The expiry date (format: MM/YY).
    #[serde(default, deserialize_with = "lenient_text")]
    #[schemars(with = "Option<String>")]
    pub expiry_date: Option<String>,

    /// Maximum Retail Price.
    #[serde(default, deserialize_with = "lenient_text")]
    #[schemars(with = "Option<String>")]
    pub mrp: Option<String>,

    /// Product quantity.
    #[serde(default, deserialize_with = "lenient_quantity")]
    #[schemars(with = "Option<i64>")]
    pub quantity: Option<i64>,
}

/// The aggregate result for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceData {
    /// Column headers as discovered on the first page; empty if that failed.
    pub headers: Vec<String>,

    /// Extracted items, in the order they were merged.
    pub items: Vec<InvoiceItem>,
}

/// Terminal status of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Ok,
    Failed,
}

/// Outcome of one page task.
///
/// Always constructed through [`PageResult::ok`] or [`PageResult::failed`]
/// so `status` and `error` cannot disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    /// 0-based page index, stable across the run.
    pub page_index: usize,

    /// Headers discovered on this page. Only ever non-empty for page 0.
    pub headers: Vec<String>,

    /// Items extracted from this page. Empty when the page failed.
    pub items: Vec<InvoiceItem>,

    pub status: PageStatus,

    /// Why the page failed, when it did.
    pub error: Option<PageError>,

    /// Wall-clock time spent on this page, including rate-limit waits.
    pub duration_ms: u64,

    /// Number of retry attempts across this page's calls.
    pub retries: u32,

    /// Prompt tokens consumed by this page's calls.
    pub input_tokens: u64,

    /// Completion tokens produced by this page's calls.
    pub output_tokens: u64,

    /// Time spent blocked on the rate limiter.
    pub rate_limit_wait_ms: u64,
}

impl PageResult {
    /// A successful page.
    pub fn ok(page_index: usize, headers: Vec<String>, items: Vec<InvoiceItem>) -> Self {
        Self {
            page_index,
            headers,
            items,
            status: PageStatus::Ok,
            error: None,
            duration_ms: 0,
            retries: 0,
            input_tokens: 0,
            output_tokens: 0,
            rate_limit_wait_ms: 0,
        }
    }

    /// A failed page. It carries no items; `headers` is kept because page 0
    /// can discover headers and still fail its item extraction.
    pub fn failed(page_index: usize, headers: Vec<String>, error: PageError) -> Self {
        Self {
            page_index,
            headers,
            items: Vec::new(),
            status: PageStatus::Failed,
            error: Some(error),
            duration_ms: 0,
            retries: 0,
            input_tokens: 0,
            output_tokens: 0,
            rate_limit_wait_ms: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == PageStatus::Ok
    }
}

/// Per-page summary kept in [`ExtractionOutput`] once the items have been
/// merged into the invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageReport {
    pub page_index: usize,
    pub status: PageStatus,
    pub item_count: usize,
    pub error: Option<PageError>,
    pub duration_ms: u64,
    pub retries: u32,
}

impl From<&PageResult> for PageReport {
    fn from(result: &PageResult) -> Self {
        Self {
            page_index: result.page_index,
            status: result.status,
            item_count: result.items.len(),
            error: result.error.clone(),
            duration_ms: result.duration_ms,
            retries: result.retries,
        }
    }
}

/// Aggregate statistics for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionStats {
    /// Pages in the document.
    pub total_pages: usize,
    /// Pages whose extraction succeeded.
    pub processed_pages: usize,
    /// Pages whose extraction failed and contributed no items.
    pub failed_pages: usize,
    /// Concurrent batches run after the header page.
    pub batches: usize,
    pub total_items: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Sum of all rate-limit waits across pages.
    pub rate_limit_wait_ms: u64,
    pub total_duration_ms: u64,
}

/// Everything a run produced: the invoice plus a report on how it went.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub invoice: InvoiceData,
    /// One report per page, sorted by page index.
    pub pages: Vec<PageReport>,
    pub stats: ExtractionStats,
}

impl ExtractionOutput {
    /// True when every page of the document was extracted successfully.
    pub fn is_complete(&self) -> bool {
        self.stats.failed_pages == 0 && self.stats.processed_pages == self.stats.total_pages
    }

    /// Errors of every failed page, in page order.
    pub fn page_errors(&self) -> impl Iterator<Item = &PageError> {
        self.pages.iter().filter_map(|p| p.error.as_ref())
    }

    /// Treat any failed page as an error.
    pub fn into_result(self) -> Result<InvoiceData, InvoiceError> {
        if self.stats.failed_pages > 0 {
            return Err(InvoiceError::PartialFailure {
                succeeded: self.stats.processed_pages,
                failed: self.stats.failed_pages,
                total: self.stats.total_pages,
            });
        }
        Ok(self.invoice)
    }
}

/// Basic facts about a PDF, available without any LLM call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub page_count: usize,
    pub title: Option<String>,
    pub author: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub pdf_version: String,
}
