//! Inference invoker: one request per document, raw completion back.
//!
//! The invoker packages rendered content and the schema contract into a
//! single chat request and hands back the completion text untouched. It does
//! not retry: every call is at-most-once, and any transport or service error
//! becomes an [`InferenceError`] that the orchestrator reports as
//! `InferenceUnavailable` for that document alone.
//!
//! The [`InferenceBackend`] trait is the seam between the pipeline and the
//! model. [`LlmBackend`] implements it over any `edgequake-llm` provider;
//! tests substitute scripted backends.

use crate::config::ExtractionConfig;
use crate::document::RenderedContent;
use crate::error::InferenceError;
use crate::pipeline::encode::page_image_data;
use crate::schema::{SchemaKind, SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// The raw completion plus token accounting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InferenceResponse {
    /// Completion text, uninterpreted.
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl InferenceResponse {
    /// A response with no token accounting.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Black-box inference capability: content + contract in, text out.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn infer(
        &self,
        content: &RenderedContent,
        schema: SchemaKind,
    ) -> Result<InferenceResponse, InferenceError>;
}

/// [`InferenceBackend`] over an `edgequake-llm` provider.
pub struct LlmBackend {
    provider: Arc<dyn LLMProvider>,
    system_prompt: Option<String>,
    temperature: f32,
    max_tokens: usize,
}

impl LlmBackend {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            system_prompt: None,
            temperature: 0.0,
            max_tokens: 4000,
        }
    }

    /// Take the prompt override and sampling options from the config.
    pub fn from_config(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// Build `CompletionOptions` from the sampling settings.
fn build_options(temperature: f32, max_tokens: usize) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(temperature),
        max_tokens: Some(max_tokens),
        ..Default::default()
    }
}

#[async_trait]
impl InferenceBackend for LlmBackend {
    async fn infer(
        &self,
        content: &RenderedContent,
        schema: SchemaKind,
    ) -> Result<InferenceResponse, InferenceError> {
        let start = Instant::now();
        let system_prompt = self.system_prompt.as_deref().unwrap_or(SYSTEM_PROMPT);
        let messages = build_messages(system_prompt, content, schema);

        let response = self
            .provider
            .chat(&messages, Some(&build_options(self.temperature, self.max_tokens)))
            .await
            .map_err(|e| InferenceError(e.to_string()))?;

        debug!(
            "{} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        Ok(InferenceResponse {
            content: response.content,
            prompt_tokens: response.prompt_tokens as u64,
            completion_tokens: response.completion_tokens as u64,
        })
    }
}

/// Build the request, in order:
///
/// 1. **System message**: JSON-only output discipline (or the override)
/// 2. **Content**: the extracted text, or every page as a base64 PNG
///    attachment in page order
/// 3. **Contract**: the schema shape and formatting rules
pub fn build_messages(
    system_prompt: &str,
    content: &RenderedContent,
    schema: SchemaKind,
) -> Vec<ChatMessage> {
    let content_message = match content {
        RenderedContent::Text(text) => ChatMessage::user(text.as_str()),
        RenderedContent::Pages(pages) => {
            ChatMessage::user_with_images("", pages.iter().map(page_image_data).collect())
        }
    };

    vec![
        ChatMessage::system(system_prompt),
        content_message,
        ChatMessage::user(schema.instructions().as_str()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RasterImage;

    #[test]
    fn build_options_defaults() {
        let config = ExtractionConfig::default();
        let opts = build_options(config.temperature, config.max_tokens);
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(4000));
    }

    #[test]
    fn three_messages_for_text_and_pages() {
        let text = RenderedContent::Text("Invoice #INV1 Total: 500".into());
        assert_eq!(build_messages(SYSTEM_PROMPT, &text, SchemaKind::Flat).len(), 3);

        let pages = RenderedContent::Pages(vec![RasterImage {
            page_index: 0,
            width: 1,
            height: 1,
            png: vec![0x89, b'P', b'N', b'G'],
        }]);
        assert_eq!(
            build_messages(SYSTEM_PROMPT, &pages, SchemaKind::ConfidenceAnnotated).len(),
            3
        );
    }

    #[test]
    fn text_response_has_no_tokens() {
        let r = InferenceResponse::text("{}");
        assert_eq!(r.content, "{}");
        assert_eq!(r.prompt_tokens, 0);
    }
}
