//! CLI binary for edgequake-invoice.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` and prints the invoice JSON.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_invoice::{
    extract_invoice, inspect, write_json, ExtractionConfig, ExtractionOutput,
    ExtractionProgressCallback, ItemOrder, ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per page. Pages inside a batch finish
/// out of order, so start times are tracked per page index.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    /// The bar starts as a spinner; `on_run_start` sets its length.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening invoice…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn elapsed(&self, page_index: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&page_index)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting line items from {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, page_index: usize, _total: usize) {
        self.start_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(page_index, Instant::now());
        self.bar.set_message(format!("page {}", page_index + 1));
    }

    fn on_page_complete(&self, page_index: usize, total: usize, item_count: usize) {
        let secs = self.elapsed(page_index);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<10}  {}",
            green("✓"),
            page_index + 1,
            total,
            dim(&format!("{item_count:>3} items")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_index: usize, total: usize, error: &str) {
        let secs = self.elapsed(page_index);
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_index + 1,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total_pages: usize, success_count: usize) {
        let failed = total_pages.saturating_sub(success_count);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} {} pages extracted successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages extracted  ({} failed)",
                if failed == total_pages { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract to stdout
  invoice2json invoice.pdf

  # Write the invoice JSON and a per-page report
  invoice2json invoice.pdf -o invoice.json --report report.json

  # Stay under a free-tier quota
  invoice2json --rate-limit 10 --workers 2 --batch-size 2 invoice.pdf

  # Stable page order, medical invoice hint
  invoice2json --page-order page --invoice-kind medical invoice.pdf

  # Fail (exit code 2) if any page could not be read
  invoice2json --strict invoice.pdf -o invoice.json

  # List the items on stderr as well
  invoice2json --summary invoice.pdf -o invoice.json

  # Inspect PDF metadata (no API key needed)
  invoice2json --inspect-only invoice.pdf

OUTPUT:
  {"headers": ["Product", "Batch", ...], "items": [{"product_name": ..., "batch_number": ...,
   "expiry_date": ..., "mrp": ..., "quantity": ...}, ...]}
  Fields the model could not read are null.

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (default provider)
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (gemini, openai, anthropic, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
"#;

/// Extract line items from multi-page invoices using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "invoice2json",
    version,
    about = "Extract line items from multi-page PDF invoices using Vision LLMs",
    long_about = "Extract product line items (name, batch, expiry, MRP, quantity) from \
multi-page PDF invoices. Column headers are read once from the first page and used as \
context for every later page, so all pages are read against the same columns.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write the invoice JSON to this file instead of stdout.
    #[arg(short, long, env = "INVOICE2JSON_OUTPUT")]
    output: Option<PathBuf>,

    /// Also write the full extraction report (per-page status, stats) here.
    #[arg(long, env = "INVOICE2JSON_REPORT")]
    report: Option<PathBuf>,

    /// LLM model ID (e.g. gemini-2.0-flash, gpt-4.1-mini).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: gemini, openai, anthropic, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Concurrent page tasks per batch.
    #[arg(short, long, env = "INVOICE2JSON_WORKERS", default_value_t = 3)]
    workers: usize,

    /// Pages per batch after the header page.
    #[arg(long, env = "INVOICE2JSON_BATCH_SIZE", default_value_t = 2)]
    batch_size: usize,

    /// Maximum LLM calls per rolling minute.
    #[arg(long, env = "INVOICE2JSON_RATE_LIMIT", default_value_t = 15)]
    rate_limit: usize,

    /// Maximum page image width in pixels.
    #[arg(long, env = "INVOICE2JSON_MAX_WIDTH", default_value_t = 1700)]
    max_width: u32,

    /// Keep page colour instead of converting to grayscale.
    #[arg(long, env = "INVOICE2JSON_COLOR")]
    color: bool,

    /// Item order across pages: arrival or page.
    #[arg(long, env = "INVOICE2JSON_PAGE_ORDER", default_value = "arrival")]
    page_order: String,

    /// Domain hint for the prompts, e.g. "medical".
    #[arg(long, env = "INVOICE2JSON_INVOICE_KIND")]
    invoice_kind: Option<String>,

    /// PDF user password for encrypted invoices.
    #[arg(long, env = "INVOICE2JSON_PASSWORD")]
    password: Option<String>,

    /// Max LLM output tokens per call.
    #[arg(long, env = "INVOICE2JSON_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "INVOICE2JSON_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries per call on provider failure.
    #[arg(long, env = "INVOICE2JSON_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "INVOICE2JSON_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "INVOICE2JSON_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// List every extracted item on stderr.
    #[arg(long, env = "INVOICE2JSON_SUMMARY")]
    summary: bool,

    /// Exit with status 2 when any page failed.
    #[arg(long, env = "INVOICE2JSON_STRICT")]
    strict: bool,

    /// Disable progress bar.
    #[arg(long, env = "INVOICE2JSON_NO_PROGRESS")]
    no_progress: bool,

    /// Print PDF metadata only, no extraction.
    #[arg(long)]
    inspect_only: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "INVOICE2JSON_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "INVOICE2JSON_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose is given.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let meta = inspect(&cli.input, cli.password.as_deref())
            .await
            .context("Failed to inspect PDF")?;
        println!("File:         {}", cli.input);
        if let Some(ref t) = meta.title {
            println!("Title:        {}", t);
        }
        if let Some(ref a) = meta.author {
            println!("Author:       {}", a);
        }
        println!("Pages:        {}", meta.page_count);
        println!("PDF Version:  {}", meta.pdf_version);
        if let Some(ref p) = meta.producer {
            println!("Producer:     {}", p);
        }
        if let Some(ref c) = meta.creator {
            println!("Creator:      {}", c);
        }
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Run extraction ───────────────────────────────────────────────────
    let output = extract_invoice(&cli.input, &config)
        .await
        .context("Extraction failed")?;

    if let Some(ref output_path) = cli.output {
        write_json(output_path, &output.invoice)
            .await
            .context("Failed to write invoice JSON")?;
    } else {
        let json =
            serde_json::to_string_pretty(&output.invoice).context("Failed to serialise invoice")?;
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{json}").context("Failed to write to stdout")?;
    }

    if let Some(ref report_path) = cli.report {
        write_json(report_path, &output)
            .await
            .context("Failed to write report")?;
    }

    if cli.summary {
        print_items(&output);
    }
    if !cli.quiet {
        print_summary(&cli, &output);
    }

    if cli.strict && !output.is_complete() {
        for err in output.page_errors() {
            eprintln!("  {} {}", red("✗"), err);
        }
        std::process::exit(2);
    }

    Ok(())
}

fn print_items(output: &ExtractionOutput) {
    let field = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    if !output.invoice.headers.is_empty() {
        eprintln!("{}", bold(&output.invoice.headers.join(" | ")));
    }
    for (n, item) in output.invoice.items.iter().enumerate() {
        eprintln!(
            "{:>4}. {}  {}  {}  {}  {}",
            n + 1,
            field(&item.product_name),
            dim(&field(&item.batch_number)),
            dim(&field(&item.expiry_date)),
            field(&item.mrp),
            item.quantity
                .map(|q| q.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
}

fn print_summary(cli: &Cli, output: &ExtractionOutput) {
    let stats = &output.stats;
    let target = cli
        .output
        .as_ref()
        .map(|p| format!("  →  {}", bold(&p.display().to_string())))
        .unwrap_or_default();
    eprintln!(
        "{}  {} items  {}/{} pages  {}ms{}",
        if stats.failed_pages == 0 { green("✔") } else { cyan("⚠") },
        stats.total_items,
        stats.processed_pages,
        stats.total_pages,
        stats.total_duration_ms,
        target,
    );
    eprintln!(
        "   {} tokens in  /  {} tokens out  /  {} waiting on rate limit",
        dim(&stats.total_input_tokens.to_string()),
        dim(&stats.total_output_tokens.to_string()),
        dim(&format!("{:.1}s", stats.rate_limit_wait_ms as f64 / 1000.0)),
    );
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let item_order: ItemOrder = cli.page_order.parse().context("Invalid --page-order")?;

    let mut builder = ExtractionConfig::builder()
        .max_workers(cli.workers)
        .batch_size(cli.batch_size)
        .max_calls_per_minute(cli.rate_limit)
        .max_image_width(cli.max_width)
        .grayscale(!cli.color)
        .item_order(item_order)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout);

    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password);
    }
    if let Some(ref kind) = cli.invoice_kind {
        builder = builder.invoice_kind(kind);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
