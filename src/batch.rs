//! Batch orchestration: one render → infer → normalise → store chain per document.
//!
//! ## Failure isolation
//!
//! Only a wholly unusable request fails the batch (no documents, no inference
//! provider). Everything that goes wrong with one document becomes an
//! `Error` outcome in that document's slot; siblings are unaffected and the
//! result list always has one entry per input, in input order.
//!
//! ## Concurrency
//!
//! With `concurrency == 1` each document's chain completes before the next
//! begins. Higher values drive up to that many chains at once through
//! `buffer_unordered`; results are sorted back into input order afterwards.
//! The store is the only shared resource.

use crate::config::ExtractionConfig;
use crate::document::SourceDocument;
use crate::error::{DocumentError, InvoiceError};
use crate::output::{BatchOutput, BatchStats, DocumentOutcome, DocumentResult};
use crate::pipeline::llm::{InferenceBackend, LlmBackend};
use crate::pipeline::render::{render_document, DocumentRenderer, PdfiumRenderer};
use crate::pipeline::{input, normalize};
use crate::record::InvoiceRecord;
use crate::store::{RecordId, RecordStore};
use edgequake_llm::{LLMProvider, ProviderFactory};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Extract, normalise and store every document in `documents`.
///
/// # Errors
/// Returns `Err(InvoiceError)` only for fatal errors:
/// - `documents` is empty
/// - no inference provider could be configured
///
/// Per-document failures are reported in the returned [`BatchOutput`].
pub async fn process_batch(
    documents: Vec<SourceDocument>,
    config: &ExtractionConfig,
    store: &dyn RecordStore,
) -> Result<BatchOutput, InvoiceError> {
    let batch_start = Instant::now();
    if documents.is_empty() {
        return Err(InvoiceError::NoDocuments);
    }
    let total = documents.len();
    info!(
        "Starting batch: {} documents, {:?} mode, {} schema",
        total, config.mode, config.schema
    );

    // ── Step 1: Resolve collaborators ────────────────────────────────────
    let inference = resolve_inference(config).await?;
    let renderer = resolve_renderer(config);
    let ctx = BatchContext {
        config,
        renderer,
        inference,
        store,
        total,
    };

    if let Some(ref cb) = config.progress_callback {
        cb.on_batch_start(total);
    }

    // ── Step 2: Process documents ────────────────────────────────────────
    let mut results: Vec<DocumentResult> = if config.concurrency <= 1 {
        let mut results = Vec::with_capacity(total);
        for (index, document) in documents.into_iter().enumerate() {
            results.push(process_document(index, document, &ctx).await);
        }
        results
    } else {
        let ctx = &ctx;
        stream::iter(
            documents
                .into_iter()
                .enumerate()
                .map(move |(index, document)| process_document(index, document, ctx)),
        )
        .buffer_unordered(config.concurrency)
        .collect()
        .await
    };

    // Restore input order
    results.sort_by_key(|r| r.index);

    // ── Step 3: Tally ────────────────────────────────────────────────────
    let stats = BatchStats::from_results(&results, batch_start.elapsed().as_millis() as u64);
    info!(
        "Batch complete: {}/{} stored, {} amount mismatches, {}ms",
        stats.succeeded, stats.total_documents, stats.amount_mismatches, stats.total_duration_ms
    );

    if let Some(ref cb) = config.progress_callback {
        cb.on_batch_complete(total, stats.succeeded);
    }

    Ok(BatchOutput { results, stats })
}

/// Load paths and URLs into documents, in order.
///
/// A source that cannot be read at all is fatal: there is no document to
/// report a per-document outcome for.
pub async fn load_sources(
    inputs: &[String],
    download_timeout_secs: u64,
) -> Result<Vec<SourceDocument>, InvoiceError> {
    let mut documents = Vec::with_capacity(inputs.len());
    for source in inputs {
        documents.push(input::load_source(source, download_timeout_secs).await?);
    }
    Ok(documents)
}

// ── Internal helpers ─────────────────────────────────────────────────────

struct BatchContext<'a> {
    config: &'a ExtractionConfig,
    renderer: Arc<dyn DocumentRenderer>,
    inference: Arc<dyn InferenceBackend>,
    store: &'a dyn RecordStore,
    total: usize,
}

#[derive(Default)]
struct TokenUsage {
    prompt: u64,
    completion: u64,
}

/// Run one document through every stage, catching its failure.
async fn process_document(
    index: usize,
    document: SourceDocument,
    ctx: &BatchContext<'_>,
) -> DocumentResult {
    let start = Instant::now();
    let filename = document.filename().to_string();
    if let Some(ref cb) = ctx.config.progress_callback {
        cb.on_document_start(index, ctx.total, &filename);
    }

    let mut usage = TokenUsage::default();
    let outcome = match extract_and_store(document, ctx, &mut usage).await {
        Ok((id, record)) => {
            info!("[{}/{}] {} stored as {}", index + 1, ctx.total, filename, id);
            if let Some(ref cb) = ctx.config.progress_callback {
                cb.on_document_complete(index, ctx.total, &filename);
            }
            DocumentOutcome::Success { id, record }
        }
        Err(e) => {
            warn!("[{}/{}] {}", index + 1, ctx.total, e);
            if let Some(ref cb) = ctx.config.progress_callback {
                cb.on_document_error(index, ctx.total, &filename, &e.to_string());
            }
            e.into()
        }
    };

    DocumentResult {
        index,
        filename,
        outcome,
        duration_ms: start.elapsed().as_millis() as u64,
        prompt_tokens: usage.prompt,
        completion_tokens: usage.completion,
    }
}

async fn extract_and_store(
    document: SourceDocument,
    ctx: &BatchContext<'_>,
    usage: &mut TokenUsage,
) -> Result<(RecordId, InvoiceRecord), DocumentError> {
    let config = ctx.config;
    let filename = document.filename().to_string();

    // Reject before any rendering work
    if !input::is_supported(&filename) {
        return Err(DocumentError::InvalidFileType { filename });
    }

    let content = render_document(Arc::clone(&ctx.renderer), Arc::new(document), config.mode).await?;
    if content.is_empty() {
        warn!("{}: nothing extracted, the model will see an empty document", filename);
    }
    debug!("{}: rendered {} units", filename, content.size_hint());

    let timeout = Duration::from_secs(config.api_timeout_secs);
    let response = match tokio::time::timeout(timeout, ctx.inference.infer(&content, config.schema)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            return Err(DocumentError::InferenceUnavailable {
                filename,
                detail: e.to_string(),
            })
        }
        Err(_) => {
            return Err(DocumentError::InferenceUnavailable {
                filename,
                detail: format!("timed out after {}s", config.api_timeout_secs),
            })
        }
    };
    usage.prompt = response.prompt_tokens;
    usage.completion = response.completion_tokens;

    let record = normalize::normalize(
        &response.content,
        config.schema,
        &filename,
        config.amount_tolerance,
    )?;

    let id = ctx
        .store
        .upsert(&record)
        .await
        .map_err(|e| DocumentError::StoreFailed {
            filename: filename.clone(),
            detail: e.to_string(),
        })?;

    Ok((id, record))
}

/// Instantiate a named provider with the given model.
fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, InvoiceError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        InvoiceError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the inference backend, from most-specific to least-specific.
///
/// 1. **Pre-built backend** (`config.inference`), used as-is.
/// 2. **Pre-built provider** (`config.provider`), wrapped in [`LlmBackend`].
/// 3. **Named provider + model** (`config.provider_name`); the factory reads
///    the matching API key from the environment.
/// 4. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 5. **OpenAI** when `OPENAI_API_KEY` is set.
/// 6. **Full auto-detection** (`ProviderFactory::from_env`).
pub async fn resolve_inference(
    config: &ExtractionConfig,
) -> Result<Arc<dyn InferenceBackend>, InvoiceError> {
    if let Some(ref backend) = config.inference {
        return Ok(Arc::clone(backend));
    }
    let provider = resolve_provider(config)?;
    Ok(Arc::new(LlmBackend::from_config(provider, config)))
}

fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, InvoiceError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        return create_provider(name, config.model_or_default());
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", config.model_or_default());
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| InvoiceError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// The configured renderer, or pdfium with the config's render settings.
pub fn resolve_renderer(config: &ExtractionConfig) -> Arc<dyn DocumentRenderer> {
    match config.renderer {
        Some(ref renderer) => Arc::clone(renderer),
        None => Arc::new(
            PdfiumRenderer::new(config.dpi, config.max_rendered_pixels)
                .with_password(config.password.clone())
                .with_library_path(config.pdfium_lib_path.clone()),
        ),
    }
}
