//! Extraction entry points.
//!
//! Every entry point follows the same path: resolve the input, open a lazy
//! page stream, build the extraction client, and hand both to the scheduler.
//! [`extract_document`] starts from an already-open page source, so callers
//! with pre-rendered images or a different rasterizer can skip pdfium.
//!
//! # Errors
//! `Err(InvoiceError)` is reserved for fatal problems: bad input, an
//! unrenderable PDF, a provider that cannot be configured. Page failures are
//! reported in [`ExtractionOutput::pages`]; use
//! [`ExtractionOutput::into_result`] to treat them as errors.

use crate::config::ExtractionConfig;
use crate::error::InvoiceError;
use crate::output::{DocumentInfo, ExtractionOutput};
use crate::pipeline::input::{self, ResolvedInput};
use crate::pipeline::llm::ExtractionClient;
use crate::pipeline::rate_limit::RateLimiter;
use crate::pipeline::render::{self, RasterizedDocument};
use crate::pipeline::scheduler::Scheduler;
use crate::pipeline::transport::{LlmTransport, VisionTransport};
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Model used when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Extract line items from a PDF file or URL.
///
/// # Example
/// ```rust,no_run
/// use edgequake_invoice::{extract_invoice, ExtractionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ExtractionConfig::default();
/// let output = extract_invoice("invoice.pdf", &config).await?;
/// println!("{}", serde_json::to_string_pretty(&output.invoice)?);
/// if !output.is_complete() {
///     eprintln!("{} pages failed", output.stats.failed_pages);
/// }
/// # Ok(())
/// # }
/// ```
pub async fn extract_invoice(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, InvoiceError> {
    let input_str = input_str.as_ref();
    info!("Starting extraction: {}", input_str);

    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    extract_resolved(&resolved, config).await
}

/// Extract line items from PDF bytes held in memory.
///
/// The bytes are written to a managed temp file that is removed on return.
pub async fn extract_from_bytes(
    bytes: &[u8],
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, InvoiceError> {
    let resolved = input::resolve_bytes(bytes)?;
    extract_resolved(&resolved, config).await
}

async fn extract_resolved(
    resolved: &ResolvedInput,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, InvoiceError> {
    // Provider problems surface before any page is rendered.
    let transport = resolve_transport(config)?;
    let document = render::rasterize(resolved.path(), config).await?;
    run(document, transport, config).await
}

/// Run the pipeline over an already-opened page source.
pub async fn extract_document(
    document: RasterizedDocument,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, InvoiceError> {
    let transport = resolve_transport(config)?;
    run(document, transport, config).await
}

async fn run(
    document: RasterizedDocument,
    transport: Arc<dyn VisionTransport>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, InvoiceError> {
    let limiter = config
        .rate_limiter
        .clone()
        .unwrap_or_else(|| Arc::new(RateLimiter::per_minute(config.max_calls_per_minute)));
    let client = ExtractionClient::new(
        transport,
        limiter,
        config.api_timeout(),
        config.max_retries,
        config.retry_backoff(),
    );
    Scheduler::new(Arc::new(client), config).run(document).await
}

/// Extract and write the invoice JSON (`{"headers", "items"}`) to a file.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn extract_to_file(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, InvoiceError> {
    let output = extract_invoice(input_str, config).await?;
    write_json(output_path.as_ref(), &output.invoice).await?;
    Ok(output)
}

/// Serialise `value` as pretty JSON and write it atomically.
pub async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), InvoiceError> {
    let write_err = |source| InvoiceError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| InvoiceError::Internal(format!("JSON serialisation failed: {}", e)))?;

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &json).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}

/// Synchronous wrapper around [`extract_invoice`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_invoice_sync(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, InvoiceError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| InvoiceError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract_invoice(input_str, config))
}

/// Read PDF facts without any LLM call.
pub async fn inspect(
    input_str: impl AsRef<str>,
    password: Option<&str>,
) -> Result<DocumentInfo, InvoiceError> {
    let resolved = input::resolve_input(input_str.as_ref(), 120).await?;
    render::inspect(resolved.path(), password).await
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, InvoiceError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        InvoiceError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Pick the transport, from most-specific to least-specific:
///
/// 1. **Pre-built transport** (`config.transport`)
/// 2. **Pre-built provider** (`config.provider`)
/// 3. **Named provider + model** (`config.provider_name`)
/// 4. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`)
/// 5. **Gemini** when `GEMINI_API_KEY` is set
/// 6. **Full auto-detection** (`ProviderFactory::from_env`)
fn resolve_transport(config: &ExtractionConfig) -> Result<Arc<dyn VisionTransport>, InvoiceError> {
    if let Some(ref transport) = config.transport {
        return Ok(Arc::clone(transport));
    }
    let provider = resolve_provider(config)?;
    Ok(Arc::new(LlmTransport::new(
        provider,
        config.temperature,
        config.max_tokens,
    )))
}

fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, InvoiceError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if std::env::var("GEMINI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider("gemini", model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| InvoiceError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set GEMINI_API_KEY, OPENAI_API_KEY or ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
