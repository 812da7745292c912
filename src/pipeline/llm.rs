//! The extraction client: one rate-limited, retried, decoded model call.
//!
//! Every call goes through the same steps:
//!
//! 1. wait for a slot on the shared [`RateLimiter`]
//! 2. send the request through the [`VisionTransport`] under a timeout
//! 3. decode the response against the requested schema
//!
//! Transport failures and timeouts are retried with exponential backoff
//! (`retry_backoff * 2^attempt`); each retry takes a fresh rate-limit slot.
//! A response that does not decode is returned as [`PageError::Parse`]
//! straight away. Nothing here is fatal to the run.

use crate::error::PageError;
use crate::output::InvoiceItem;
use crate::pipeline::encode::PagePayload;
use crate::pipeline::rate_limit::RateLimiter;
use crate::pipeline::transport::{TransportError, VisionRequest, VisionTransport};
use crate::schema::{parse_headers, parse_items, ResponseSchema};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bookkeeping for one logical call, retries included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallMeta {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub retries: u32,
    pub rate_limit_wait: Duration,
}

impl CallMeta {
    pub fn absorb(&mut self, other: CallMeta) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.retries += other.retries;
        self.rate_limit_wait += other.rate_limit_wait;
    }
}

/// Result of a call: the decoded value or a page error, with its meta
/// either way.
pub type CallOutcome<T> = (Result<T, PageError>, CallMeta);

/// Shared by every page task of a run.
pub struct ExtractionClient {
    transport: Arc<dyn VisionTransport>,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl std::fmt::Debug for ExtractionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionClient")
            .field("limiter", &self.limiter)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff", &self.retry_backoff)
            .finish()
    }
}

impl ExtractionClient {
    pub fn new(
        transport: Arc<dyn VisionTransport>,
        limiter: Arc<RateLimiter>,
        timeout: Duration,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            transport,
            limiter,
            timeout,
            max_retries,
            retry_backoff,
        }
    }

    pub fn requires_file(&self) -> bool {
        self.transport.requires_file()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Phase A: the column headers of the page, verbatim and in order.
    pub async fn extract_headers(
        &self,
        page_index: usize,
        payload: &PagePayload,
        prompt: &str,
    ) -> CallOutcome<Vec<String>> {
        self.extract(page_index, payload, prompt, ResponseSchema::Headers, parse_headers)
            .await
    }

    /// The line items of the page.
    pub async fn extract_items(
        &self,
        page_index: usize,
        payload: &PagePayload,
        prompt: &str,
    ) -> CallOutcome<Vec<InvoiceItem>> {
        self.extract(page_index, payload, prompt, ResponseSchema::Items, parse_items)
            .await
    }

    async fn extract<T>(
        &self,
        page_index: usize,
        payload: &PagePayload,
        prompt: &str,
        schema: ResponseSchema,
        decode: fn(&str) -> Result<T, serde_json::Error>,
    ) -> CallOutcome<T> {
        let mut meta = CallMeta::default();
        let request = VisionRequest {
            page_index,
            prompt,
            schema,
            payload,
        };

        let mut last_err: Option<PageError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff * 2u32.saturating_pow(attempt - 1);
                warn!(
                    "Page {} ({}): retry {}/{} after {}ms",
                    page_index,
                    schema,
                    attempt,
                    self.max_retries,
                    backoff.as_millis()
                );
                tokio::time::sleep(backoff).await;
                meta.retries += 1;
            }

            meta.rate_limit_wait += self.limiter.acquire().await;

            let response = match tokio::time::timeout(self.timeout, self.transport.complete(request)).await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    warn!("Page {} ({}): attempt {} failed: {}", page_index, schema, attempt + 1, e);
                    last_err = Some(match e {
                        TransportError::Upload(detail) => PageError::Upload {
                            page: page_index,
                            detail,
                        },
                        TransportError::Model(detail) => PageError::Model {
                            page: page_index,
                            detail,
                        },
                    });
                    continue;
                }
                Err(_) => {
                    warn!(
                        "Page {} ({}): attempt {} timed out after {}s",
                        page_index,
                        schema,
                        attempt + 1,
                        self.timeout.as_secs()
                    );
                    last_err = Some(PageError::Model {
                        page: page_index,
                        detail: format!("timed out after {}s", self.timeout.as_secs()),
                    });
                    continue;
                }
            };

            meta.input_tokens += response.input_tokens;
            meta.output_tokens += response.output_tokens;
            debug!(
                "Page {} ({}): {} input tokens, {} output tokens",
                page_index, schema, response.input_tokens, response.output_tokens
            );

            let decoded = decode(&response.content).map_err(|e| {
                warn!("Page {} ({}): undecodable response: {}", page_index, schema, e);
                PageError::Parse {
                    page: page_index,
                    schema: schema.name().to_string(),
                    detail: e.to_string(),
                }
            });
            return (decoded, meta);
        }

        let err = last_err.unwrap_or_else(|| PageError::Model {
            page: page_index,
            detail: "no attempt was made".into(),
        });
        (Err(err), meta)
    }
}
