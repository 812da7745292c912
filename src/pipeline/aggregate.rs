//! Merging page results into one invoice.
//!
//! The aggregator is the only writer of the result. Headers are taken from
//! page 0 and nowhere else; items are appended as results arrive, or held
//! back and emitted in page order when [`ItemOrder::PageIndex`] is set.
//! Failed pages contribute no items but are still reported.

use crate::config::ItemOrder;
use crate::output::{ExtractionOutput, ExtractionStats, InvoiceData, InvoiceItem, PageReport, PageResult};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug)]
pub struct Aggregator {
    order: ItemOrder,
    total_pages: usize,
    headers: Vec<String>,
    items: Vec<InvoiceItem>,
    held: BTreeMap<usize, Vec<InvoiceItem>>,
    reports: Vec<PageReport>,
    stats: ExtractionStats,
}

impl Aggregator {
    pub fn new(total_pages: usize, order: ItemOrder) -> Self {
        Self {
            order,
            total_pages,
            headers: Vec::new(),
            items: Vec::new(),
            held: BTreeMap::new(),
            reports: Vec::with_capacity(total_pages),
            stats: ExtractionStats {
                total_pages,
                ..Default::default()
            },
        }
    }

    /// Fold one page in. The result's buffers are consumed.
    pub fn merge(&mut self, result: PageResult) {
        self.reports.push(PageReport::from(&result));
        self.stats.total_input_tokens += result.input_tokens;
        self.stats.total_output_tokens += result.output_tokens;
        self.stats.rate_limit_wait_ms += result.rate_limit_wait_ms;

        let ok = result.is_ok();
        let PageResult {
            page_index,
            headers,
            items,
            ..
        } = result;

        if page_index == 0 {
            self.headers = headers;
        }

        if !ok {
            self.stats.failed_pages += 1;
            return;
        }
        self.stats.processed_pages += 1;

        debug!("Merging {} items from page {}", items.len(), page_index);
        match self.order {
            ItemOrder::Arrival => self.items.extend(items),
            ItemOrder::PageIndex => {
                self.held.insert(page_index, items);
            }
        }
    }

    pub fn record_batch(&mut self) {
        self.stats.batches += 1;
    }

    /// Pages merged so far.
    pub fn merged(&self) -> usize {
        self.reports.len()
    }

    /// Freeze the result.
    pub fn finish(mut self, total_duration_ms: u64) -> ExtractionOutput {
        for (_, items) in std::mem::take(&mut self.held) {
            self.items.extend(items);
        }
        self.reports.sort_by_key(|r| r.page_index);
        self.stats.total_items = self.items.len();
        self.stats.total_duration_ms = total_duration_ms;
        debug_assert!(self.reports.len() <= self.total_pages);

        ExtractionOutput {
            invoice: InvoiceData {
                headers: self.headers,
                items: self.items,
            },
            pages: self.reports,
            stats: self.stats,
        }
    }
}
