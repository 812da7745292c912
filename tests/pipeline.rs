//! Pipeline tests against a scripted vision transport.
//!
//! No pdfium and no network: pages come from in-memory images via
//! [`RasterizedDocument`], and every model call is answered by
//! [`ScriptedTransport`], which also records when each call started and
//! ended so ordering guarantees can be checked.

use edgequake_invoice::pipeline::encode::PagePayload;
use edgequake_invoice::{
    extract_document, ExtractionConfig, ExtractionOutput, ExtractionProgressCallback,
    InvoiceError, InvoiceItem, ItemOrder, ManualClock, PageError, PageStatus, RasterPage,
    RasterizedDocument, RateLimiter, ResponseSchema, TransportError, VisionRequest,
    VisionResponse, VisionTransport,
};
use image::{DynamicImage, GrayImage, Luma};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::assert_ok;

// ── Scripted transport ───────────────────────────────────────────────────────

const HEADERS_JSON: &str = r#"{"headers": ["Product", "Batch", "Expiry", "MRP", "Qty"]}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Start,
    End,
}

#[derive(Debug, Clone)]
struct Event {
    page: usize,
    schema: ResponseSchema,
    edge: Edge,
}

type Script = dyn Fn(usize, ResponseSchema) -> Result<String, TransportError> + Send + Sync;

struct ScriptedTransport {
    script: Box<Script>,
    delays: HashMap<usize, Duration>,
    requires_file: bool,
    events: Mutex<Vec<Event>>,
    prompts: Mutex<Vec<(usize, ResponseSchema, String)>>,
    files: Mutex<Vec<PathBuf>>,
}

impl ScriptedTransport {
    fn new(
        script: impl Fn(usize, ResponseSchema) -> Result<String, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            delays: HashMap::new(),
            requires_file: false,
            events: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            files: Mutex::new(Vec::new()),
        }
    }

    /// Headers on page 0, two items on every page.
    fn well_behaved() -> Self {
        Self::new(|page, schema| Ok(default_response(page, schema)))
    }

    fn with_delay(mut self, page: usize, delay: Duration) -> Self {
        self.delays.insert(page, delay);
        self
    }

    fn staged_on_disk(mut self) -> Self {
        self.requires_file = true;
        self
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn prompts_for(&self, page: usize, schema: ResponseSchema) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, s, _)| *p == page && *s == schema)
            .map(|(_, _, prompt)| prompt.clone())
            .collect()
    }

    /// Position of the first event matching `page`, `schema` and `edge`.
    fn position(&self, page: usize, schema: ResponseSchema, edge: Edge) -> usize {
        self.events()
            .iter()
            .position(|e| e.page == page && e.schema == schema && e.edge == edge)
            .unwrap_or_else(|| panic!("no {edge:?} event for page {page} ({schema})"))
    }
}

#[async_trait::async_trait]
impl VisionTransport for ScriptedTransport {
    fn requires_file(&self) -> bool {
        self.requires_file
    }

    async fn complete(&self, request: VisionRequest<'_>) -> Result<VisionResponse, TransportError> {
        let page = request.page_index;
        self.events.lock().unwrap().push(Event {
            page,
            schema: request.schema,
            edge: Edge::Start,
        });
        self.prompts
            .lock()
            .unwrap()
            .push((page, request.schema, request.prompt.to_string()));

        if let PagePayload::File(path) = request.payload {
            assert!(path.exists(), "spooled page {page} missing during call");
            self.files.lock().unwrap().push(path.clone());
        }
        if let Some(delay) = self.delays.get(&page) {
            tokio::time::sleep(*delay).await;
        }

        let result = (self.script)(page, request.schema);
        self.events.lock().unwrap().push(Event {
            page,
            schema: request.schema,
            edge: Edge::End,
        });
        result.map(|content| VisionResponse {
            content,
            input_tokens: 100,
            output_tokens: 20,
        })
    }
}

fn default_response(page: usize, schema: ResponseSchema) -> String {
    match schema {
        ResponseSchema::Headers => HEADERS_JSON.to_string(),
        ResponseSchema::Items => items_json(page),
    }
}

fn items_json(page: usize) -> String {
    format!(
        r#"{{"items": [
            {{"product_name": "Item {page}-A", "batch_number": "B{page}1", "expiry_date": "12/26", "mrp": "45.50", "quantity": 10}},
            {{"product_name": "Item {page}-B", "batch_number": "B{page}2", "expiry_date": "01/27", "mrp": "12.00", "quantity": 3}}
        ]}}"#
    )
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("edgequake_invoice=debug")
        .with_test_writer()
        .try_init();
}

fn blank_page() -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_pixel(16, 24, Luma([255])))
}

fn document(pages: usize) -> RasterizedDocument {
    RasterizedDocument::from_images((0..pages).map(|_| blank_page()).collect())
}

fn config(transport: Arc<ScriptedTransport>) -> ExtractionConfig {
    assert_ok!(ExtractionConfig::builder()
        .transport(transport)
        .max_calls_per_minute(1_000)
        .max_retries(0)
        .build())
}

async fn run(pages: usize, transport: Arc<ScriptedTransport>) -> ExtractionOutput {
    init_tracing();
    assert_ok!(extract_document(document(pages), &config(transport)).await)
}

fn names(items: &[InvoiceItem]) -> Vec<String> {
    items
        .iter()
        .map(|i| i.product_name.clone().unwrap_or_default())
        .collect()
}

// ── Header propagation ───────────────────────────────────────────────────────

#[tokio::test]
async fn headers_are_requested_once_for_page_zero() {
    let transport = Arc::new(ScriptedTransport::well_behaved());
    let output = run(5, Arc::clone(&transport)).await;

    let header_calls: Vec<_> = transport
        .events()
        .into_iter()
        .filter(|e| e.schema == ResponseSchema::Headers && e.edge == Edge::Start)
        .collect();
    assert_eq!(header_calls.len(), 1);
    assert_eq!(header_calls[0].page, 0);

    assert_eq!(
        output.invoice.headers,
        vec!["Product", "Batch", "Expiry", "MRP", "Qty"]
    );
    assert_eq!(output.invoice.items.len(), 10);
    assert!(output.is_complete());
}

#[tokio::test]
async fn later_pages_see_the_canonical_headers() {
    let transport = Arc::new(ScriptedTransport::well_behaved());
    run(3, Arc::clone(&transport)).await;

    let first = transport.prompts_for(0, ResponseSchema::Items);
    assert_eq!(first.len(), 1);
    assert!(first[0].contains("Use the exact column headers you see in the table."));

    for page in 1..3 {
        let prompts = transport.prompts_for(page, ResponseSchema::Items);
        assert_eq!(prompts.len(), 1);
        assert!(
            prompts[0].contains("Use these column headers: Product, Batch, Expiry, MRP, Qty"),
            "page {page} prompt: {}",
            prompts[0]
        );
        assert!(prompts[0].contains(&format!("This is page {} of the same invoice.", page + 1)));
    }
}

#[tokio::test]
async fn no_later_page_is_dispatched_before_page_zero_finishes() {
    let transport = Arc::new(
        ScriptedTransport::well_behaved().with_delay(0, Duration::from_millis(40)),
    );
    run(4, Arc::clone(&transport)).await;

    let page0_done = transport.position(0, ResponseSchema::Items, Edge::End);
    let header_done = transport.position(0, ResponseSchema::Headers, Edge::End);
    assert!(header_done < page0_done);
    for page in 1..4 {
        let start = transport.position(page, ResponseSchema::Items, Edge::Start);
        assert!(
            start > page0_done,
            "page {page} started at event {start}, page 0 finished at {page0_done}"
        );
    }
}

#[tokio::test]
async fn failed_header_call_falls_back_to_page_columns() {
    let transport = Arc::new(ScriptedTransport::new(|page, schema| match schema {
        ResponseSchema::Headers => Err(TransportError::Model("HTTP 503".into())),
        ResponseSchema::Items => Ok(items_json(page)),
    }));
    let output = run(3, Arc::clone(&transport)).await;

    assert!(output.invoice.headers.is_empty());
    // Page 0's own item call still ran and counted.
    assert_eq!(output.pages[0].status, PageStatus::Ok);
    assert_eq!(output.invoice.items.len(), 6);

    for page in 1..3 {
        let prompt = &transport.prompts_for(page, ResponseSchema::Items)[0];
        assert!(prompt.contains("Use the exact column headers you see in the table."));
        assert!(!prompt.contains("Use these column headers"));
    }
}

#[tokio::test]
async fn empty_header_list_is_treated_like_a_failure() {
    let transport = Arc::new(ScriptedTransport::new(|page, schema| match schema {
        ResponseSchema::Headers => Ok(r#"{"headers": []}"#.to_string()),
        ResponseSchema::Items => Ok(items_json(page)),
    }));
    let output = run(2, Arc::clone(&transport)).await;

    assert!(output.invoice.headers.is_empty());
    let prompt = &transport.prompts_for(1, ResponseSchema::Items)[0];
    assert!(!prompt.contains("Use these column headers"));
}

#[tokio::test]
async fn failed_first_page_items_keep_its_headers() {
    let transport = Arc::new(ScriptedTransport::new(|page, schema| match (page, schema) {
        (0, ResponseSchema::Items) => Err(TransportError::Model("HTTP 500".into())),
        _ => Ok(default_response(page, schema)),
    }));
    let output = run(3, Arc::clone(&transport)).await;

    assert_eq!(output.invoice.headers.len(), 5);
    assert_eq!(output.pages[0].status, PageStatus::Failed);
    assert_eq!(output.stats.failed_pages, 1);
    assert_eq!(output.invoice.items.len(), 4);

    for page in 1..3 {
        let prompt = &transport.prompts_for(page, ResponseSchema::Items)[0];
        assert!(
            prompt.contains("Use these column headers"),
            "page {page} prompt: {prompt}"
        );
    }
}

// ── Failure isolation ────────────────────────────────────────────────────────

#[tokio::test]
async fn malformed_json_on_one_page_costs_only_that_page() {
    let transport = Arc::new(ScriptedTransport::new(|page, schema| match (page, schema) {
        (2, ResponseSchema::Items) => Ok("Sorry, I cannot read this table.".to_string()),
        _ => Ok(default_response(page, schema)),
    }));
    let output = run(4, Arc::clone(&transport)).await;

    assert_eq!(output.stats.total_pages, 4);
    assert_eq!(output.stats.processed_pages, 3);
    assert_eq!(output.stats.failed_pages, 1);
    assert_eq!(output.invoice.items.len(), 6);
    assert!(!names(&output.invoice.items)
        .iter()
        .any(|n| n.starts_with("Item 2-")));

    let report = &output.pages[2];
    assert_eq!(report.status, PageStatus::Failed);
    assert_eq!(report.item_count, 0);
    assert!(matches!(report.error, Some(PageError::Parse { page: 2, .. })));

    // Parse failures are not retried: exactly one item call for page 2.
    assert_eq!(transport.prompts_for(2, ResponseSchema::Items).len(), 1);

    let err = output.into_result().unwrap_err();
    assert!(matches!(
        err,
        InvoiceError::PartialFailure {
            succeeded: 3,
            failed: 1,
            total: 4
        }
    ));
}

#[tokio::test]
async fn provider_error_on_a_page_is_page_local() {
    let transport = Arc::new(ScriptedTransport::new(|page, schema| match (page, schema) {
        (1, ResponseSchema::Items) => Err(TransportError::Model("quota exceeded".into())),
        _ => Ok(default_response(page, schema)),
    }));
    let output = run(3, transport).await;

    assert_eq!(output.stats.failed_pages, 1);
    assert!(matches!(output.pages[1].error, Some(PageError::Model { page: 1, .. })));
    assert_eq!(output.invoice.items.len(), 4);
    assert_eq!(output.invoice.headers.len(), 5);
}

#[tokio::test]
async fn rasterization_error_mid_stream_aborts_the_run() {
    init_tracing();
    let transport = Arc::new(ScriptedTransport::well_behaved());
    let pages = vec![
        Ok(RasterPage {
            page_index: 0,
            image: blank_page(),
        }),
        Ok(RasterPage {
            page_index: 1,
            image: blank_page(),
        }),
        Err(InvoiceError::Rasterization {
            path: PathBuf::from("broken.pdf"),
            detail: "page 2 could not be rendered".into(),
        }),
    ];
    let doc = RasterizedDocument::new(3, futures::stream::iter(pages));

    let err = extract_document(doc, &config(transport)).await.unwrap_err();
    assert!(err.is_rasterization(), "got {err:?}");
}

#[tokio::test]
async fn short_page_stream_aborts_the_run() {
    init_tracing();
    let transport = Arc::new(ScriptedTransport::well_behaved());
    let pages = vec![Ok(RasterPage {
        page_index: 0,
        image: blank_page(),
    })];
    let doc = RasterizedDocument::new(3, futures::stream::iter(pages));

    let err = extract_document(doc, &config(transport)).await.unwrap_err();
    assert!(err.is_rasterization(), "got {err:?}");
    assert!(matches!(
        err,
        InvoiceError::IncompleteRasterization {
            rendered: 1,
            expected: 3
        }
    ));
}

#[tokio::test]
async fn page_stream_with_no_pages_aborts_a_non_empty_document() {
    let transport = Arc::new(ScriptedTransport::well_behaved());
    let doc = RasterizedDocument::new(
        2,
        futures::stream::iter(Vec::<Result<RasterPage, InvoiceError>>::new()),
    );

    let err = extract_document(doc, &config(Arc::clone(&transport)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        InvoiceError::IncompleteRasterization {
            rendered: 0,
            expected: 2
        }
    ));
    assert!(transport.events().is_empty());
}

// ── Batching ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn batches_run_concurrently_and_never_overlap() {
    init_tracing();
    let transport = Arc::new(
        ScriptedTransport::well_behaved()
            .with_delay(1, Duration::from_millis(60))
            .with_delay(2, Duration::from_millis(30)),
    );
    let config = assert_ok!(ExtractionConfig::builder()
        .transport(Arc::clone(&transport) as Arc<dyn VisionTransport>)
        .max_calls_per_minute(1_000)
        .max_retries(0)
        .max_workers(2)
        .batch_size(2)
        .build());

    let output = assert_ok!(extract_document(document(4), &config).await);
    assert_eq!(output.stats.batches, 2);

    let items = ResponseSchema::Items;
    // Pages 1 and 2 form one batch and are in flight together.
    let start1 = transport.position(1, items, Edge::Start);
    let start2 = transport.position(2, items, Edge::Start);
    let end1 = transport.position(1, items, Edge::End);
    let end2 = transport.position(2, items, Edge::End);
    assert!(start1.max(start2) < end1.min(end2));

    // Page 3 waits for the whole first batch.
    let start3 = transport.position(3, items, Edge::Start);
    assert!(start3 > end1 && start3 > end2);
}

#[tokio::test]
async fn single_worker_serialises_a_batch() {
    init_tracing();
    let transport = Arc::new(
        ScriptedTransport::well_behaved().with_delay(1, Duration::from_millis(20)),
    );
    let config = assert_ok!(ExtractionConfig::builder()
        .transport(Arc::clone(&transport) as Arc<dyn VisionTransport>)
        .max_calls_per_minute(1_000)
        .max_retries(0)
        .max_workers(1)
        .batch_size(3)
        .build());

    assert_ok!(extract_document(document(4), &config).await);

    let events = transport.events();
    let mut in_flight = 0i32;
    for e in events.iter().filter(|e| e.page > 0) {
        match e.edge {
            Edge::Start => in_flight += 1,
            Edge::End => in_flight -= 1,
        }
        assert!(in_flight <= 1, "more than one page in flight: {events:?}");
    }
}

// ── Ordering and idempotence ─────────────────────────────────────────────────

#[tokio::test]
async fn page_index_order_is_stable_regardless_of_completion() {
    init_tracing();
    // Page 1 is slowest, so in arrival order its items would come last.
    let transport = Arc::new(
        ScriptedTransport::well_behaved().with_delay(1, Duration::from_millis(50)),
    );
    let config = assert_ok!(ExtractionConfig::builder()
        .transport(Arc::clone(&transport) as Arc<dyn VisionTransport>)
        .max_calls_per_minute(1_000)
        .max_retries(0)
        .batch_size(3)
        .max_workers(3)
        .item_order(ItemOrder::PageIndex)
        .build());

    let output = assert_ok!(extract_document(document(4), &config).await);
    assert_eq!(
        names(&output.invoice.items),
        vec![
            "Item 0-A", "Item 0-B", "Item 1-A", "Item 1-B", "Item 2-A", "Item 2-B", "Item 3-A",
            "Item 3-B"
        ]
    );
}

#[tokio::test]
async fn items_from_one_page_stay_contiguous() {
    let transport = Arc::new(
        ScriptedTransport::well_behaved()
            .with_delay(1, Duration::from_millis(30))
            .with_delay(3, Duration::from_millis(10)),
    );
    let output = run(5, transport).await;

    let names = names(&output.invoice.items);
    assert_eq!(&names[..2], ["Item 0-A", "Item 0-B"]);
    for pair in names.chunks(2) {
        let a = pair[0].trim_end_matches("-A");
        let b = pair[1].trim_end_matches("-B");
        assert_eq!(a, b, "page items interleaved: {names:?}");
    }
}

#[tokio::test]
async fn repeated_runs_yield_the_same_items() {
    let first = run(
        4,
        Arc::new(ScriptedTransport::well_behaved().with_delay(2, Duration::from_millis(15))),
    )
    .await;
    let second = run(
        4,
        Arc::new(ScriptedTransport::well_behaved().with_delay(1, Duration::from_millis(15))),
    )
    .await;

    let mut a = first.invoice.items.clone();
    let mut b = second.invoice.items.clone();
    a.sort();
    b.sort();
    assert_eq!(a, b);
    assert_eq!(first.invoice.headers, second.invoice.headers);
}

// ── Edge cases ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_page_with_headers_but_no_items() {
    let transport = Arc::new(ScriptedTransport::new(|_, schema| match schema {
        ResponseSchema::Headers => Ok(HEADERS_JSON.to_string()),
        ResponseSchema::Items => Ok(r#"{"items": []}"#.to_string()),
    }));
    let output = run(1, transport).await;

    assert_eq!(output.invoice.headers.len(), 5);
    assert!(output.invoice.items.is_empty());
    assert!(output.is_complete());
    assert_eq!(output.stats.batches, 0);
}

#[tokio::test]
async fn empty_document_makes_no_calls() {
    let transport = Arc::new(ScriptedTransport::well_behaved());
    let output = run(0, Arc::clone(&transport)).await;

    assert!(transport.events().is_empty());
    assert!(output.invoice.headers.is_empty());
    assert!(output.invoice.items.is_empty());
    assert_eq!(output.stats.total_pages, 0);
    assert!(output.is_complete());
}

#[tokio::test]
async fn fenced_and_partial_items_decode_with_nulls() {
    let transport = Arc::new(ScriptedTransport::new(|_, schema| match schema {
        ResponseSchema::Headers => Ok(format!("```json\n{HEADERS_JSON}\n```")),
        ResponseSchema::Items => Ok(
            "```json\n{\"items\": [{\"product_name\": \"Paracetamol\", \"quantity\": \"12\"}]}\n```"
                .to_string(),
        ),
    }));
    let output = run(1, transport).await;

    let item = &output.invoice.items[0];
    assert_eq!(item.product_name.as_deref(), Some("Paracetamol"));
    assert_eq!(item.quantity, Some(12));
    assert_eq!(item.batch_number, None);
    assert_eq!(item.expiry_date, None);
    assert_eq!(item.mrp, None);
}

// ── Rate limiting ────────────────────────────────────────────────────────────

#[tokio::test]
async fn shared_limiter_holds_calls_over_the_ceiling() {
    init_tracing();
    let clock = Arc::new(ManualClock::new());
    let limiter = Arc::new(RateLimiter::with_clock(
        2,
        Duration::from_secs(60),
        Arc::clone(&clock) as _,
    ));
    let transport = Arc::new(ScriptedTransport::well_behaved());
    let config = assert_ok!(ExtractionConfig::builder()
        .transport(Arc::clone(&transport) as Arc<dyn VisionTransport>)
        .rate_limiter(Arc::clone(&limiter))
        .max_retries(0)
        .build());

    // Header + page 0 items fill the window; page 1 or 2 must wait it out.
    let output = assert_ok!(extract_document(document(3), &config).await);

    assert!(output.is_complete());
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(60)]);
    assert_eq!(output.stats.rate_limit_wait_ms, 60_000);
    assert_eq!(transport.events().len(), 8);
}

// ── Staging and progress ─────────────────────────────────────────────────────

#[tokio::test]
async fn spooled_pages_are_removed_after_the_run() {
    let transport = Arc::new(ScriptedTransport::well_behaved().staged_on_disk());
    let output = run(3, Arc::clone(&transport)).await;
    assert!(output.is_complete());

    let files = transport.files.lock().unwrap().clone();
    // Page 0 is sent twice (headers and items) from the same file.
    assert_eq!(files.len(), 4);
    for file in &files {
        assert!(!file.exists(), "{} was left behind", file.display());
        if let Some(dir) = file.parent() {
            assert!(!dir.exists(), "spool directory {} was left behind", dir.display());
        }
    }
}

#[derive(Default)]
struct CountingProgress {
    started: AtomicUsize,
    completed: AtomicUsize,
    errored: AtomicUsize,
    items: AtomicUsize,
    run_total: AtomicUsize,
    run_success: AtomicUsize,
}

impl ExtractionProgressCallback for CountingProgress {
    fn on_run_start(&self, total_pages: usize) {
        self.run_total.store(total_pages, Ordering::SeqCst);
    }

    fn on_page_start(&self, _page_index: usize, _total: usize) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_page_complete(&self, _page_index: usize, _total: usize, item_count: usize) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.items.fetch_add(item_count, Ordering::SeqCst);
    }

    fn on_page_error(&self, _page_index: usize, _total: usize, _error: &str) {
        self.errored.fetch_add(1, Ordering::SeqCst);
    }

    fn on_run_complete(&self, _total_pages: usize, success_count: usize) {
        self.run_success.store(success_count, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn progress_callback_sees_every_page() {
    init_tracing();
    let transport = Arc::new(ScriptedTransport::new(|page, schema| match (page, schema) {
        (3, ResponseSchema::Items) => Ok("{not json".to_string()),
        _ => Ok(default_response(page, schema)),
    }));
    let progress = Arc::new(CountingProgress::default());
    let config = assert_ok!(ExtractionConfig::builder()
        .transport(transport as Arc<dyn VisionTransport>)
        .max_calls_per_minute(1_000)
        .max_retries(0)
        .progress_callback(Arc::clone(&progress) as _)
        .build());

    assert_ok!(extract_document(document(5), &config).await);

    assert_eq!(progress.run_total.load(Ordering::SeqCst), 5);
    assert_eq!(progress.started.load(Ordering::SeqCst), 5);
    assert_eq!(progress.completed.load(Ordering::SeqCst), 4);
    assert_eq!(progress.errored.load(Ordering::SeqCst), 1);
    assert_eq!(progress.items.load(Ordering::SeqCst), 8);
    assert_eq!(progress.run_success.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn token_usage_is_totalled() {
    let output = run(2, Arc::new(ScriptedTransport::well_behaved())).await;
    // Three calls: header + two item calls.
    assert_eq!(output.stats.total_input_tokens, 300);
    assert_eq!(output.stats.total_output_tokens, 60);
}
