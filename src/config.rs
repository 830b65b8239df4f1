//! Configuration types for invoice extraction.
//!
//! All pipeline behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. The schema family and extraction mode
//! are chosen here once per deployment and never inferred from a document.

pub use crate::document::ExtractionMode;

use crate::error::InvoiceError;
use crate::pipeline::llm::InferenceBackend;
use crate::pipeline::render::DocumentRenderer;
use crate::progress::ProgressCallback;
use crate::schema::SchemaKind;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Configuration for a batch extraction.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use invoice_extract::{ExtractionConfig, ExtractionMode, SchemaKind};
///
/// let config = ExtractionConfig::builder()
///     .mode(ExtractionMode::Vision)
///     .schema(SchemaKind::ConfidenceAnnotated)
///     .dpi(200)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Text layer or page images. Default: [`ExtractionMode::Text`].
    pub mode: ExtractionMode,

    /// Schema family sent to the model and enforced on the way back.
    /// Default: [`SchemaKind::Flat`].
    pub schema: SchemaKind,

    /// Rendering DPI for vision mode. Range: 72–600. Default: 300.
    pub dpi: u32,

    /// Maximum rendered image dimension (width or height) in pixels. Default: 4000.
    ///
    /// A cap independent of DPI so oversized pages cannot exhaust memory.
    pub max_rendered_pixels: u32,

    /// Documents processed at once. Default: 1.
    ///
    /// With 1, each document's render → infer → normalise → store chain
    /// completes before the next begins. Higher values run documents
    /// concurrently; results are still returned in input order.
    pub concurrency: usize,

    /// Model identifier, e.g. "gpt-4o", "claude-sonnet-4-20250514".
    /// If None, [`DEFAULT_MODEL`] is used where a model must be named.
    pub model: Option<String>,

    /// Provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, the provider is detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed inference backend. Takes precedence over every provider setting.
    pub inference: Option<Arc<dyn InferenceBackend>>,

    /// Pre-constructed renderer. If None, pdfium is used.
    pub renderer: Option<Arc<dyn DocumentRenderer>>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the model may generate per document. Default: 4000.
    ///
    /// The confidence-annotated schema roughly triples the completion size;
    /// a long invoice truncated mid-object fails as a malformed response.
    pub max_tokens: usize,

    /// Caller-side timeout for one inference call, in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Largest difference between the item sum and the declared total that
    /// still counts as equal. Default: 0.01.
    pub amount_tolerance: f64,

    /// Custom system prompt. If None, uses the built-in JSON-only prompt.
    pub system_prompt: Option<String>,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Directory containing the pdfium shared library.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Optional per-document progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            mode: ExtractionMode::default(),
            schema: SchemaKind::default(),
            dpi: 300,
            max_rendered_pixels: 4000,
            concurrency: 1,
            model: None,
            provider_name: None,
            provider: None,
            inference: None,
            renderer: None,
            temperature: 0.0,
            max_tokens: 4000,
            api_timeout_secs: 120,
            download_timeout_secs: 120,
            amount_tolerance: 0.01,
            system_prompt: None,
            password: None,
            pdfium_lib_path: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("mode", &self.mode)
            .field("schema", &self.schema)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("concurrency", &self.concurrency)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("inference", &self.inference.as_ref().map(|_| "<dyn InferenceBackend>"))
            .field("renderer", &self.renderer.as_ref().map(|_| "<dyn DocumentRenderer>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("amount_tolerance", &self.amount_tolerance)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
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

    /// The configured model, or [`DEFAULT_MODEL`].
    pub fn model_or_default(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn mode(mut self, mode: ExtractionMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn schema(mut self, schema: SchemaKind) -> Self {
        self.config.schema = schema;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
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

    pub fn inference(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.config.inference = Some(backend);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn DocumentRenderer>) -> Self {
        self.config.renderer = Some(renderer);
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

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn amount_tolerance(mut self, tolerance: f64) -> Self {
        self.config.amount_tolerance = tolerance;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, InvoiceError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(InvoiceError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.concurrency == 0 {
            return Err(InvoiceError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(InvoiceError::InvalidConfig(
                "max_tokens must be ≥ 1".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(InvoiceError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if !c.amount_tolerance.is_finite() || c.amount_tolerance < 0.0 {
            return Err(InvoiceError::InvalidConfig(format!(
                "Amount tolerance must be a non-negative number, got {}",
                c.amount_tolerance
            )));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ExtractionConfig::default();
        assert_eq!(c.mode, ExtractionMode::Text);
        assert_eq!(c.schema, SchemaKind::Flat);
        assert_eq!(c.dpi, 300);
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.model_or_default(), DEFAULT_MODEL);
        assert_eq!(c.amount_tolerance, 0.01);
    }

    #[test]
    fn builder_clamps() {
        let c = ExtractionConfig::builder()
            .dpi(10_000)
            .concurrency(0)
            .temperature(9.0)
            .build()
            .unwrap();
        assert_eq!(c.dpi, 600);
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn invalid_tolerance_rejected() {
        let err = ExtractionConfig::builder()
            .amount_tolerance(-1.0)
            .build()
            .unwrap_err();
        assert!(matches!(err, InvoiceError::InvalidConfig(_)));

        assert!(ExtractionConfig::builder()
            .amount_tolerance(f64::NAN)
            .build()
            .is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        assert!(ExtractionConfig::builder().api_timeout_secs(0).build().is_err());
        assert!(ExtractionConfig::builder().max_tokens(0).build().is_err());
    }

    #[test]
    fn debug_redacts_password() {
        let c = ExtractionConfig::builder().password("hunter2").build().unwrap();
        let s = format!("{c:?}");
        assert!(!s.contains("hunter2"));
        assert!(s.contains("<redacted>"));
    }
}
