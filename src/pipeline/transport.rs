//! The boundary between the extraction client and a concrete model API.
//!
//! A transport takes one page payload, a prompt and the target schema, and
//! returns the model's raw text. It knows nothing about retries, rate limits
//! or decoding; those belong to [`crate::pipeline::llm::ExtractionClient`].
//!
//! [`LlmTransport`] adapts any `edgequake_llm` provider. Custom backends
//! (and the test doubles in `tests/`) implement [`VisionTransport`] directly.

use crate::pipeline::encode::{image_data, png_to_base64, PagePayload};
use crate::prompts::system_prompt;
use crate::schema::ResponseSchema;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// One extraction request.
#[derive(Debug, Clone, Copy)]
pub struct VisionRequest<'a> {
    pub page_index: usize,
    pub prompt: &'a str,
    pub schema: ResponseSchema,
    pub payload: &'a PagePayload,
}

/// Raw model output plus token accounting.
#[derive(Debug, Clone, Default)]
pub struct VisionResponse {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl VisionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Transport-level failure. Both kinds are page-local and retryable.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The page could not be handed to the provider.
    #[error("upload failed: {0}")]
    Upload(String),

    /// The provider answered with an error.
    #[error("{0}")]
    Model(String),
}

/// A vision-capable model endpoint.
#[async_trait]
pub trait VisionTransport: Send + Sync {
    /// Whether pages must be staged on disk before [`Self::complete`].
    fn requires_file(&self) -> bool {
        false
    }

    /// Send one request and return the raw response text.
    async fn complete(&self, request: VisionRequest<'_>) -> Result<VisionResponse, TransportError>;
}

/// [`VisionTransport`] over an `edgequake_llm` provider.
///
/// The request is a system message holding the prompt and the JSON Schema,
/// followed by a user message carrying the page image.
pub struct LlmTransport {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl fmt::Debug for LlmTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmTransport")
            .field("provider", &"<dyn LLMProvider>")
            .field("temperature", &self.options.temperature)
            .field("max_tokens", &self.options.max_tokens)
            .finish()
    }
}

impl LlmTransport {
    pub fn new(provider: Arc<dyn LLMProvider>, temperature: f32, max_tokens: usize) -> Self {
        Self {
            provider,
            options: CompletionOptions {
                temperature: Some(temperature),
                max_tokens: Some(max_tokens),
                ..Default::default()
            },
        }
    }

    pub fn provider(&self) -> &Arc<dyn LLMProvider> {
        &self.provider
    }
}

#[async_trait]
impl VisionTransport for LlmTransport {
    async fn complete(&self, request: VisionRequest<'_>) -> Result<VisionResponse, TransportError> {
        let image = match request.payload {
            PagePayload::Inline(b64) => image_data(b64.clone()),
            PagePayload::File(path) => {
                let png = tokio::fs::read(path).await.map_err(|e| {
                    TransportError::Upload(format!("reading {}: {}", path.display(), e))
                })?;
                image_data(png_to_base64(&png))
            }
        };

        let messages = vec![
            ChatMessage::system(format!(
                "{}\n\n{}",
                system_prompt(request.schema),
                request.prompt
            )),
            ChatMessage::user_with_images("", vec![image]),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| TransportError::Model(e.to_string()))?;

        Ok(VisionResponse {
            content: response.content,
            input_tokens: response.prompt_tokens as u64,
            output_tokens: response.completion_tokens as u64,
        })
    }
}
