//! Configuration types for invoice line-item extraction.
//!
//! All extraction behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. Every knob lives in one struct so a
//! config can be shared across page tasks and printed in a single log line.
//!
//! Setters clamp obviously out-of-range values; [`ExtractionConfigBuilder::build`]
//! rejects combinations that cannot run at all.

use crate::error::InvoiceError;
use crate::pipeline::rate_limit::RateLimiter;
use crate::pipeline::transport::VisionTransport;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for one invoice extraction run.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_invoice::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .max_workers(4)
///     .batch_size(4)
///     .max_calls_per_minute(30)
///     .model("gemini-2.0-flash")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Maximum page tasks in flight at once inside a batch. Default: 3.
    ///
    /// The effective concurrency of a batch is `min(max_workers, batch_size)`.
    pub max_workers: usize,

    /// Pages pulled from the rasterizer per batch after the header page. Default: 2.
    ///
    /// Only one batch of images is held in memory at a time, so this also
    /// bounds peak memory for long invoices.
    pub batch_size: usize,

    /// Ceiling on extraction calls started in any rolling 60-second window. Default: 15.
    ///
    /// Header and item calls both count. Retries count too.
    pub max_calls_per_minute: usize,

    /// Maximum page image width in pixels. Default: 1700.
    ///
    /// Wider renders are downscaled with the aspect ratio preserved.
    pub max_image_width: u32,

    /// Maximum page image height in pixels handed to pdfium. Default: 2800.
    pub max_image_height: u32,

    /// Convert page images to single-channel grayscale. Default: true.
    ///
    /// Invoices are read for text; colour roughly triples the upload size.
    pub grayscale: bool,

    /// LLM model identifier, e.g. "gemini-2.0-flash", "gpt-4.1-mini".
    /// If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "gemini", "openai", "anthropic").
    /// If None along with `provider`, the provider is auto-detected.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed vision transport. Takes precedence over every provider
    /// setting; used for custom backends and for tests.
    pub transport: Option<Arc<dyn VisionTransport>>,

    /// Shared rate limiter. When None, each run gets its own limiter built
    /// from `max_calls_per_minute`.
    ///
    /// Share one limiter between concurrent runs that draw on the same API
    /// quota.
    pub rate_limiter: Option<Arc<RateLimiter>>,

    /// Sampling temperature for the LLM completion. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per call. Default: 8192.
    ///
    /// A dense invoice page can hold fifty line items; at roughly eighty
    /// tokens per item a small limit truncates the JSON mid-array.
    pub max_tokens: usize,

    /// Retry attempts per call on transport failures. Default: 2.
    ///
    /// Parse failures are never retried.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled after each attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Order in which items from different pages are merged. Default: arrival.
    pub item_order: ItemOrder,

    /// PDF user password for encrypted invoices.
    pub password: Option<String>,

    /// Optional domain hint woven into the item prompts, e.g. "medical".
    pub invoice_kind: Option<String>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional progress callback for per-page events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            batch_size: 2,
            max_calls_per_minute: 15,
            max_image_width: 1700,
            max_image_height: 2800,
            grayscale: true,
            model: None,
            provider_name: None,
            provider: None,
            transport: None,
            rate_limiter: None,
            temperature: 0.1,
            max_tokens: 8192,
            max_retries: 2,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            item_order: ItemOrder::default(),
            password: None,
            invoice_kind: None,
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("max_workers", &self.max_workers)
            .field("batch_size", &self.batch_size)
            .field("max_calls_per_minute", &self.max_calls_per_minute)
            .field("max_image_width", &self.max_image_width)
            .field("max_image_height", &self.max_image_height)
            .field("grayscale", &self.grayscale)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field(
                "transport",
                &self.transport.as_ref().map(|_| "<dyn VisionTransport>"),
            )
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("item_order", &self.item_order)
            .field("invoice_kind", &self.invoice_kind)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Tasks allowed in flight inside one batch.
    pub fn effective_concurrency(&self) -> usize {
        self.max_workers.min(self.batch_size).max(1)
    }

    pub(crate) fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub(crate) fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Builder for [`ExtractionConfig`].
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl fmt::Debug for ExtractionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ExtractionConfigBuilder {
    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n.max(1);
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch_size = n.max(1);
        self
    }

    pub fn max_calls_per_minute(mut self, n: usize) -> Self {
        self.config.max_calls_per_minute = n.max(1);
        self
    }

    pub fn max_image_width(mut self, px: u32) -> Self {
        self.config.max_image_width = px.max(100);
        self
    }

    pub fn max_image_height(mut self, px: u32) -> Self {
        self.config.max_image_height = px.max(100);
        self
    }

    pub fn grayscale(mut self, v: bool) -> Self {
        self.config.grayscale = v;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn VisionTransport>) -> Self {
        self.config.transport = Some(transport);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.config.rate_limiter = Some(limiter);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn item_order(mut self, order: ItemOrder) -> Self {
        self.config.item_order = order;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn invoice_kind(mut self, kind: impl Into<String>) -> Self {
        self.config.invoice_kind = Some(kind.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Attach a progress callback that receives per-page events.
    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, InvoiceError> {
        let c = &self.config;
        if c.max_workers == 0 {
            return Err(InvoiceError::InvalidConfig(
                "max_workers must be ≥ 1".into(),
            ));
        }
        if c.batch_size == 0 {
            return Err(InvoiceError::InvalidConfig("batch_size must be ≥ 1".into()));
        }
        if c.max_calls_per_minute == 0 {
            return Err(InvoiceError::InvalidConfig(
                "max_calls_per_minute must be ≥ 1".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(InvoiceError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.api_timeout_secs == 0 {
            return Err(InvoiceError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How items from different pages are ordered in the final invoice.
///
/// | Order | Result |
/// |-------|--------|
/// | `Arrival` | page 0 first, then each batch's pages in completion order (default) |
/// | `PageIndex` | strictly by page index, regardless of completion order |
///
/// Items from one page always stay contiguous and in the order the model
/// returned them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOrder {
    #[default]
    Arrival,
    PageIndex,
}

impl FromStr for ItemOrder {
    type Err = InvoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arrival" => Ok(ItemOrder::Arrival),
            "page" | "page-index" | "page_index" => Ok(ItemOrder::PageIndex),
            other => Err(InvoiceError::InvalidConfig(format!(
                "unknown item order '{other}' (expected 'arrival' or 'page')"
            ))),
        }
    }
}
