//! Page batch scheduler: page 0 alone, then fixed-size concurrent batches.
//!
//! ## Run Phases
//!
//! ```text
//! Init ──▶ HeaderPhase ──▶ BatchPhase(1) ──▶ … ──▶ BatchPhase(k) ──▶ Done
//!   │           │                │
//!   └───────────┴────────────────┴──▶ Aborted   (rasterization error)
//! ```
//!
//! * **HeaderPhase**: page 0 is processed on its own. Its header call and its
//!   item call both finish before any other page is dispatched, so every
//!   later prompt sees the final header list.
//! * **BatchPhase(k)**: up to `batch_size` pages are pulled from the
//!   rasterizer and run as one [`JoinSet`], at most
//!   `min(max_workers, batch_size)` at a time. Results are merged as they
//!   complete. The set is drained before the next batch is pulled, which
//!   bounds both concurrency and the number of page images alive at once.
//!
//! A page failure of any kind becomes a failed [`PageResult`]; only the page
//! stream itself can abort the run, by yielding an error or by ending before
//! `page_count` pages arrived.

use crate::config::{ExtractionConfig, ItemOrder};
use crate::error::{InvoiceError, PageError};
use crate::output::{ExtractionOutput, InvoiceItem, PageResult};
use crate::pipeline::aggregate::Aggregator;
use crate::pipeline::encode::{prepare_payload, PagePayload};
use crate::pipeline::headers::CanonicalHeaders;
use crate::pipeline::llm::{CallMeta, ExtractionClient};
use crate::pipeline::render::{RasterPage, RasterizedDocument};
use crate::pipeline::spool::Spool;
use crate::progress::ProgressCallback;
use crate::prompts;
use futures::{FutureExt as _, StreamExt as _};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    HeaderPhase,
    BatchPhase(usize),
    Done,
    Aborted,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Init => f.write_str("init"),
            RunPhase::HeaderPhase => f.write_str("header phase"),
            RunPhase::BatchPhase(k) => write!(f, "batch {}", k),
            RunPhase::Done => f.write_str("done"),
            RunPhase::Aborted => f.write_str("aborted"),
        }
    }
}

/// Everything a page task needs, cheap to clone into each task.
#[derive(Clone)]
struct PageContext {
    client: Arc<ExtractionClient>,
    spool: Option<Arc<Spool>>,
    invoice_kind: Option<Arc<str>>,
    progress: Option<ProgressCallback>,
    total_pages: usize,
}

pub struct Scheduler {
    client: Arc<ExtractionClient>,
    batch_size: usize,
    concurrency: usize,
    item_order: ItemOrder,
    invoice_kind: Option<Arc<str>>,
    progress: Option<ProgressCallback>,
    phase: RunPhase,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("batch_size", &self.batch_size)
            .field("concurrency", &self.concurrency)
            .field("item_order", &self.item_order)
            .field("phase", &self.phase)
            .finish()
    }
}

impl Scheduler {
    pub fn new(client: Arc<ExtractionClient>, config: &ExtractionConfig) -> Self {
        Self {
            client,
            batch_size: config.batch_size.max(1),
            concurrency: config.effective_concurrency(),
            item_order: config.item_order,
            invoice_kind: config.invoice_kind.as_deref().map(Arc::from),
            progress: config.progress_callback.clone(),
            phase: RunPhase::Init,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn enter(&mut self, next: RunPhase) {
        info!("Run phase: {} → {}", self.phase, next);
        self.phase = next;
    }

    /// Process every page of `document`.
    ///
    /// Returns `Err` only when the page stream fails; page-level failures
    /// are reported inside the output.
    pub async fn run(&mut self, document: RasterizedDocument) -> Result<ExtractionOutput, InvoiceError> {
        let spool = if self.client.requires_file() {
            let spool = Spool::new().map_err(|e| {
                InvoiceError::Internal(format!("could not create page spool: {}", e))
            })?;
            Some(Arc::new(spool))
        } else {
            None
        };

        let result = self.run_pages(document, spool.clone()).await;

        if let Some(spool) = spool {
            spool.close();
        }
        if result.is_err() {
            self.enter(RunPhase::Aborted);
        }
        result
    }

    async fn run_pages(
        &mut self,
        document: RasterizedDocument,
        spool: Option<Arc<Spool>>,
    ) -> Result<ExtractionOutput, InvoiceError> {
        let start = Instant::now();
        let RasterizedDocument {
            page_count,
            mut pages,
        } = document;

        info!(
            "Extracting {} pages (batch size {}, {} workers, limit {})",
            page_count,
            self.batch_size,
            self.concurrency,
            self.client.limiter()
        );
        if let Some(cb) = &self.progress {
            cb.on_run_start(page_count);
        }

        let ctx = PageContext {
            client: Arc::clone(&self.client),
            spool,
            invoice_kind: self.invoice_kind.clone(),
            progress: self.progress.clone(),
            total_pages: page_count,
        };
        let mut aggregator = Aggregator::new(page_count, self.item_order);

        let first = match pages.next().await {
            None if page_count > 0 => {
                error!("Page stream ended before the first of {} pages", page_count);
                return Err(InvoiceError::IncompleteRasterization {
                    rendered: 0,
                    expected: page_count,
                });
            }
            None => {
                self.enter(RunPhase::Done);
                return Ok(self.complete(aggregator, start));
            }
            Some(Err(e)) => {
                error!("Rasterization failed before the first page: {}", e);
                return Err(e);
            }
            Some(Ok(page)) => page,
        };

        self.enter(RunPhase::HeaderPhase);
        let (first_result, headers) = process_first_page(&ctx, first).await;
        aggregator.merge(first_result);
        if headers.is_empty() {
            warn!("No column headers discovered; later pages will infer their own columns");
        } else {
            info!("Canonical headers: {:?}", headers);
        }

        let mut batch_no = 0;
        loop {
            let mut batch = Vec::with_capacity(self.batch_size);
            while batch.len() < self.batch_size {
                match pages.next().await {
                    Some(Ok(page)) => batch.push(page),
                    Some(Err(e)) => {
                        error!("Rasterization failed: {}", e);
                        return Err(e);
                    }
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }

            batch_no += 1;
            self.enter(RunPhase::BatchPhase(batch_no));
            self.run_batch(&ctx, &headers, batch, &mut aggregator).await;
            aggregator.record_batch();
        }

        // A render thread that dies drops its sender and the stream just ends.
        if aggregator.merged() < page_count {
            error!(
                "Page stream ended after {} of {} pages",
                aggregator.merged(),
                page_count
            );
            return Err(InvoiceError::IncompleteRasterization {
                rendered: aggregator.merged(),
                expected: page_count,
            });
        }

        self.enter(RunPhase::Done);
        Ok(self.complete(aggregator, start))
    }

    /// Run one batch to completion, merging results as they finish.
    async fn run_batch(
        &self,
        ctx: &PageContext,
        headers: &CanonicalHeaders,
        batch: Vec<RasterPage>,
        aggregator: &mut Aggregator,
    ) {
        let mut outstanding: BTreeSet<usize> = batch.iter().map(|p| p.page_index).collect();
        let mut pending: VecDeque<RasterPage> = batch.into();
        let mut set = JoinSet::new();

        debug!("Dispatching pages {:?}", outstanding);
        loop {
            while set.len() < self.concurrency {
                let Some(page) = pending.pop_front() else {
                    break;
                };
                let page_index = page.page_index;
                let task = process_page(ctx.clone(), headers.clone(), page);
                set.spawn(AssertUnwindSafe(task).catch_unwind().map(move |r| {
                    r.unwrap_or_else(|_| {
                        PageResult::failed(
                            page_index,
                            Vec::new(),
                            PageError::Model {
                                page: page_index,
                                detail: "page task panicked".into(),
                            },
                        )
                    })
                }));
            }

            match set.join_next().await {
                Some(Ok(result)) => {
                    outstanding.remove(&result.page_index);
                    aggregator.merge(result);
                }
                Some(Err(e)) => error!("Page task did not finish: {}", e),
                None => break,
            }
        }

        // A task that never reported still counts as a failed page.
        for page_index in outstanding {
            aggregator.merge(PageResult::failed(
                page_index,
                Vec::new(),
                PageError::Model {
                    page: page_index,
                    detail: "page task was cancelled".into(),
                },
            ));
        }
    }

    fn complete(&self, aggregator: Aggregator, start: Instant) -> ExtractionOutput {
        let output = aggregator.finish(start.elapsed().as_millis() as u64);
        info!(
            "Extraction finished: {}/{} pages, {} items, {} failed, {}ms",
            output.stats.processed_pages,
            output.stats.total_pages,
            output.stats.total_items,
            output.stats.failed_pages,
            output.stats.total_duration_ms
        );
        if let Some(cb) = &self.progress {
            cb.on_run_complete(output.stats.total_pages, output.stats.processed_pages);
        }
        output
    }
}

/// Page 0: Phase A header call, then its own item call.
async fn process_first_page(ctx: &PageContext, page: RasterPage) -> (PageResult, CanonicalHeaders) {
    let start = Instant::now();
    let page_index = page.page_index;
    if let Some(cb) = &ctx.progress {
        cb.on_page_start(page_index, ctx.total_pages);
    }

    let payload = match prepare_payload(page, ctx.spool.clone()).await {
        Ok(p) => p,
        Err(detail) => {
            let err = PageError::Upload {
                page: page_index,
                detail,
            };
            let result = finish_page(ctx, page_index, Vec::new(), Err(err), CallMeta::default(), start);
            return (result, CanonicalHeaders::empty());
        }
    };

    let mut meta = CallMeta::default();
    let (found, header_meta) = ctx
        .client
        .extract_headers(page_index, &payload, &prompts::header_prompt())
        .await;
    meta.absorb(header_meta);
    let headers = match found {
        Ok(h) if !h.is_empty() => CanonicalHeaders::discovered(h),
        Ok(_) => {
            warn!("Page {}: header extraction returned no headers", page_index);
            CanonicalHeaders::empty()
        }
        Err(e) => {
            warn!("Header extraction failed: {}", e);
            CanonicalHeaders::empty()
        }
    };

    let prompt = headers.item_prompt(page_index, ctx.invoice_kind.as_deref());
    let (items, item_meta) = ctx.client.extract_items(page_index, &payload, &prompt).await;
    meta.absorb(item_meta);
    release(ctx, payload);

    let result = finish_page(ctx, page_index, headers.to_vec(), items, meta, start);
    (result, headers)
}

/// Any page after the first: one Phase B item call.
async fn process_page(ctx: PageContext, headers: CanonicalHeaders, page: RasterPage) -> PageResult {
    let start = Instant::now();
    let page_index = page.page_index;
    if let Some(cb) = &ctx.progress {
        cb.on_page_start(page_index, ctx.total_pages);
    }

    let payload = match prepare_payload(page, ctx.spool.clone()).await {
        Ok(p) => p,
        Err(detail) => {
            let err = PageError::Upload {
                page: page_index,
                detail,
            };
            return finish_page(&ctx, page_index, Vec::new(), Err(err), CallMeta::default(), start);
        }
    };

    let prompt = headers.item_prompt(page_index, ctx.invoice_kind.as_deref());
    let (items, meta) = ctx.client.extract_items(page_index, &payload, &prompt).await;
    release(&ctx, payload);

    finish_page(&ctx, page_index, Vec::new(), items, meta, start)
}

/// Drop the payload and its spooled file, if any.
fn release(ctx: &PageContext, payload: PagePayload) {
    if let (Some(spool), Some(path)) = (&ctx.spool, payload.file_path()) {
        spool.release(path);
    }
}

fn finish_page(
    ctx: &PageContext,
    page_index: usize,
    headers: Vec<String>,
    items: Result<Vec<InvoiceItem>, PageError>,
    meta: CallMeta,
    start: Instant,
) -> PageResult {
    let mut result = match items {
        Ok(items) => {
            debug!("Page {}: {} items", page_index, items.len());
            if let Some(cb) = &ctx.progress {
                cb.on_page_complete(page_index, ctx.total_pages, items.len());
            }
            PageResult::ok(page_index, headers, items)
        }
        Err(err) => {
            warn!("Page {} failed: {}", page_index, err);
            if let Some(cb) = &ctx.progress {
                cb.on_page_error(page_index, ctx.total_pages, &err.to_string());
            }
            PageResult::failed(page_index, headers, err)
        }
    };
    result.duration_ms = start.elapsed().as_millis() as u64;
    result.retries = meta.retries;
    result.input_tokens = meta.input_tokens;
    result.output_tokens = meta.output_tokens;
    result.rate_limit_wait_ms = meta.rate_limit_wait.as_millis() as u64;
    result
}
