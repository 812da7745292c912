//! End-to-end integration tests for edgequake-invoice.
//!
//! These tests use real invoice PDFs in `./test_cases/` and make live LLM API
//! calls. They are gated behind the `E2E_ENABLED` environment variable so
//! they do not run in CI unless explicitly requested.
//!
//! Run with:
//!   E2E_ENABLED=1 PDFIUM_LIB_PATH=. cargo test --test e2e -- --nocapture
//!
//! Expected fixtures:
//!   test_cases/invoice_single_page.pdf   one page with a full item table
//!   test_cases/invoice_multi_page.pdf    the table continues across pages

use edgequake_invoice::{
    extract_invoice, extract_to_file, inspect, ExtractionConfig, InvoiceData, InvoiceError,
    ItemOrder,
};
use std::path::PathBuf;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn test_cases_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases")
}

fn output_dir() -> PathBuf {
    let d = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases/output");
    std::fs::create_dir_all(&d).ok();
    d
}

/// Skip this test if E2E_ENABLED is not set *or* no PDF file at `path`.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP: test file not found: {}", p.display());
            return;
        }
        p
    }};
}

/// Basic sanity checks on an extracted invoice.
fn assert_invoice_quality(invoice: &InvoiceData, context: &str) {
    assert!(
        !invoice.headers.is_empty(),
        "[{context}] No column headers discovered"
    );
    assert!(!invoice.items.is_empty(), "[{context}] No items extracted");

    let named = invoice
        .items
        .iter()
        .filter(|i| i.product_name.as_deref().is_some_and(|n| !n.trim().is_empty()))
        .count();
    assert!(
        named * 2 >= invoice.items.len(),
        "[{context}] Fewer than half the items have a product name ({named}/{})",
        invoice.items.len()
    );

    for item in &invoice.items {
        if let Some(q) = item.quantity {
            assert!(q >= 0, "[{context}] Negative quantity: {item:?}");
        }
    }

    println!(
        "[{context}] ✓  {} headers, {} items",
        invoice.headers.len(),
        invoice.items.len()
    );
}

// ── Inspect tests (no LLM, instant) ──────────────────────────────────────────

#[tokio::test]
async fn test_inspect_multi_page_invoice() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("invoice_multi_page.pdf"));

    let meta = inspect(path.to_str().unwrap(), None)
        .await
        .expect("inspect() should succeed");

    assert!(meta.page_count >= 2, "fixture should span several pages");
    assert!(!meta.pdf_version.is_empty());
    println!("Metadata: {:?}", meta);
}

#[tokio::test]
async fn test_inspect_nonexistent() {
    if std::env::var("E2E_ENABLED").is_err() {
        println!("SKIP");
        return;
    }

    let result = inspect("/definitely/not/a/real/invoice.pdf", None).await;
    assert!(matches!(result, Err(InvoiceError::FileNotFound { .. })));
}

// ── Extraction tests (need LLM API) ──────────────────────────────────────────

#[tokio::test]
async fn test_extract_single_page() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("invoice_single_page.pdf"));

    let config = ExtractionConfig::builder()
        .max_retries(2)
        .build()
        .expect("valid config");

    let output = extract_invoice(path.to_str().unwrap(), &config)
        .await
        .expect("extraction should succeed");

    assert_eq!(output.stats.total_pages, 1);
    assert_eq!(output.stats.failed_pages, 0);
    assert!(output.stats.total_input_tokens > 0);
    assert_invoice_quality(&output.invoice, "single_page");
}

#[tokio::test]
async fn test_extract_multi_page_keeps_headers() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("invoice_multi_page.pdf"));
    let out_path = output_dir().join("invoice_multi_page.json");

    let config = ExtractionConfig::builder()
        .max_workers(2)
        .batch_size(2)
        .max_calls_per_minute(10)
        .item_order(ItemOrder::PageIndex)
        .invoice_kind("medical")
        .build()
        .expect("valid config");

    let output = extract_to_file(path.to_str().unwrap(), &out_path, &config)
        .await
        .expect("extraction should succeed");

    assert!(output.stats.total_pages >= 2);
    assert_invoice_quality(&output.invoice, "multi_page");

    // Every page after the first should contribute rows of the same table.
    let contributing = output.pages.iter().filter(|p| p.item_count > 0).count();
    assert!(
        contributing >= 2,
        "items came from only {contributing} page(s)"
    );

    let written: InvoiceData =
        serde_json::from_str(&std::fs::read_to_string(&out_path).unwrap()).unwrap();
    assert_eq!(written, output.invoice);
    println!("[multi_page] Saved to {}", out_path.display());
    println!(
        "[multi_page] Tokens: {} in / {} out, rate-limit wait {}ms",
        output.stats.total_input_tokens,
        output.stats.total_output_tokens,
        output.stats.rate_limit_wait_ms
    );
}

#[tokio::test]
async fn test_spreadsheet_is_rejected_before_any_call() {
    if std::env::var("E2E_ENABLED").is_err() {
        println!("SKIP");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stock.xlsx");
    std::fs::write(&path, b"PK\x03\x04").unwrap();

    let err = extract_invoice(path.to_str().unwrap(), &ExtractionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, InvoiceError::ConversionRequired { .. }));
}
