//! CLI binary for invoice-extract.
//!
//! A thin shim over the library crate: maps flags to `ExtractionConfig`,
//! opens a record store and prints results as JSON.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use invoice_extract::{
    load_sources, process_batch, BatchProgressCallback, DuplicatePolicy, ExtractionConfig,
    ExtractionMode, FileStore, ProgressCallback, RecordStore, SchemaKind,
};
use serde_json::{Map, Value};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Progress bar with one log line per document. Works when documents
/// complete out of order (concurrency > 1).
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} documents  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
        bar.set_style(style);
        bar.set_prefix("Extracting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn on_document_start(&self, _index: usize, _total: usize, filename: &str) {
        self.bar.set_message(filename.to_string());
    }

    fn on_document_complete(&self, index: usize, total: usize, filename: &str) {
        self.bar.println(format!(
            "  {} {:>3}/{:<3} {}",
            green("✓"),
            index + 1,
            total,
            filename
        ));
        self.bar.inc(1);
    }

    fn on_document_error(&self, index: usize, total: usize, _filename: &str, error: &str) {
        let msg = if error.chars().count() > 100 {
            format!("{}\u{2026}", error.chars().take(99).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {:>3}/{:<3} {}",
            red("✗"),
            index + 1,
            total,
            red(&msg)
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total: usize, success_count: usize) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {}/{} documents stored",
            if success_count == total {
                green("✔")
            } else {
                red("✘")
            },
            bold(&success_count.to_string()),
            total
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract two invoices into the default store
  invoice-extract extract inv1.pdf inv2.pdf

  # Scanned invoices with per-field confidence
  invoice-extract extract --mode vision --schema confidence-annotated scan.pdf

  # Download and extract
  invoice-extract extract https://example.com/invoice.pdf

  # Browse and correct stored records
  invoice-extract list
  invoice-extract get inv1.pdf
  invoice-extract update inv1.pdf --set invoice_number=INV-001 --set pan_id=ABCDE1234F
  invoice-extract update inv2.pdf --set Details.tax_details.pan_id=ABCDE1234F

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Directory containing libpdfium
  INVOICE_STORE_DIR       Record store directory
"#;

/// Extract structured invoice records from PDFs.
#[derive(Parser, Debug)]
#[command(
    name = "invoice-extract",
    version,
    about = "Extract structured invoice records from PDFs using language and vision models",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory of the file-backed record store.
    #[arg(long, global = true, env = "INVOICE_STORE_DIR", default_value = ".invoice-store")]
    store_dir: PathBuf,

    /// MongoDB connection string; overrides --store-dir when set.
    #[cfg(feature = "mongodb")]
    #[arg(long, global = true, env = "INVOICE_MONGODB_URL")]
    mongodb_url: Option<String>,

    /// What to do when a filename is extracted again.
    #[arg(long, global = true, env = "INVOICE_DUPLICATES", value_enum, default_value = "replace")]
    duplicates: DuplicatesArg,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "INVOICE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "INVOICE_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract, normalise and store invoices.
    Extract(ExtractArgs),
    /// List stored filenames.
    List,
    /// Print the stored record for a filename.
    Get { filename: String },
    /// Set fields on a stored record.
    Update {
        filename: String,
        /// KEY=VALUE; KEY may be a dotted path, VALUE is parsed as JSON when possible.
        #[arg(long = "set", value_name = "KEY=VALUE", required = true)]
        set: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// Local PDF paths or HTTP/HTTPS URLs.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Text layer or page images.
    #[arg(long, env = "INVOICE_MODE", value_enum, default_value = "text")]
    mode: ModeArg,

    /// Target schema family.
    #[arg(long, env = "INVOICE_SCHEMA", value_enum, default_value = "flat")]
    schema: SchemaArg,

    /// LLM model ID (e.g. gpt-4o-mini, gpt-4o, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Rendering DPI for vision mode (72–600).
    #[arg(long, env = "INVOICE_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Documents processed at once.
    #[arg(short, long, env = "INVOICE_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "INVOICE_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "INVOICE_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max LLM output tokens per document.
    #[arg(long, env = "INVOICE_MAX_TOKENS", default_value_t = 4000)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "INVOICE_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Largest item-sum vs total difference still treated as equal.
    #[arg(long, env = "INVOICE_AMOUNT_TOLERANCE", default_value_t = 0.01)]
    amount_tolerance: f64,

    /// Directory containing libpdfium.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<PathBuf>,

    /// Disable progress bar.
    #[arg(long, env = "INVOICE_NO_PROGRESS")]
    no_progress: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "INVOICE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Per-document LLM call timeout in seconds.
    #[arg(long, env = "INVOICE_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Text,
    Vision,
}

impl From<ModeArg> for ExtractionMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::Text => ExtractionMode::Text,
            ModeArg::Vision => ExtractionMode::Vision,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum SchemaArg {
    Flat,
    Nested,
    ConfidenceAnnotated,
}

impl From<SchemaArg> for SchemaKind {
    fn from(v: SchemaArg) -> Self {
        match v {
            SchemaArg::Flat => SchemaKind::Flat,
            SchemaArg::Nested => SchemaKind::Nested,
            SchemaArg::ConfidenceAnnotated => SchemaKind::ConfidenceAnnotated,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum DuplicatesArg {
    Replace,
    Append,
}

impl From<DuplicatesArg> for DuplicatePolicy {
    fn from(v: DuplicatesArg) -> Self {
        match v {
            DuplicatesArg::Replace => DuplicatePolicy::Replace,
            DuplicatesArg::Append => DuplicatePolicy::Append,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level logs during extraction.
    let show_progress = matches!(&cli.command, Command::Extract(args) if !args.no_progress)
        && !cli.quiet;
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

    let store = open_store(&cli).await?;

    match &cli.command {
        Command::Extract(args) => {
            let progress: Option<ProgressCallback> = if show_progress {
                Some(CliProgressCallback::new() as Arc<dyn BatchProgressCallback>)
            } else {
                None
            };
            let config = build_config(args, progress).await?;

            let documents = load_sources(&args.inputs, args.download_timeout)
                .await
                .context("Failed to load documents")?;
            let output = process_batch(documents, &config, store.as_ref())
                .await
                .context("Extraction failed")?;

            println!(
                "{}",
                serde_json::to_string_pretty(&output).context("Failed to serialise output")?
            );

            if !cli.quiet && !show_progress {
                eprintln!(
                    "Stored {}/{} documents in {}ms ({} tokens in / {} tokens out)",
                    output.stats.succeeded,
                    output.stats.total_documents,
                    output.stats.total_duration_ms,
                    output.stats.total_prompt_tokens,
                    output.stats.total_completion_tokens,
                );
            }
            if output.stats.amount_mismatches > 0 && !cli.quiet {
                eprintln!(
                    "{} {} record(s) flagged with an amount mismatch",
                    red("⚠"),
                    output.stats.amount_mismatches
                );
            }
        }
        Command::List => {
            let mut names = store.list().await.context("Failed to list records")?;
            names.sort();
            for name in names {
                println!("{name}");
            }
        }
        Command::Get { filename } => {
            let stored = store
                .get(filename)
                .await
                .with_context(|| format!("Failed to get '{filename}'"))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&stored).context("Failed to serialise record")?
            );
        }
        Command::Update { filename, set } => {
            let fields = parse_assignments(set)?;
            store
                .update(filename, fields)
                .await
                .with_context(|| format!("Failed to update '{filename}'"))?;
            if !cli.quiet {
                eprintln!("{} updated {}", green("✔"), bold(filename));
            }
        }
    }

    Ok(())
}

/// Open the configured record store.
async fn open_store(cli: &Cli) -> Result<Box<dyn RecordStore>> {
    #[cfg(feature = "mongodb")]
    if let Some(ref url) = cli.mongodb_url {
        let store = invoice_extract::store::MongoStore::connect(url, None, None)
            .await
            .context("Failed to connect to MongoDB")?
            .with_policy(cli.duplicates.into());
        return Ok(Box::new(store));
    }

    let store = FileStore::open(&cli.store_dir)
        .await
        .with_context(|| format!("Failed to open store at {:?}", cli.store_dir))?
        .with_policy(cli.duplicates.into());
    Ok(Box::new(store))
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(
    args: &ExtractArgs,
    progress: Option<ProgressCallback>,
) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .mode(args.mode.into())
        .schema(args.schema.into())
        .dpi(args.dpi)
        .concurrency(args.concurrency)
        .max_tokens(args.max_tokens)
        .temperature(args.temperature)
        .amount_tolerance(args.amount_tolerance)
        .download_timeout_secs(args.download_timeout)
        .api_timeout_secs(args.api_timeout);

    if let Some(ref path) = args.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(ref model) = args.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref password) = args.password {
        builder = builder.password(password);
    }
    if let Some(ref dir) = args.pdfium_lib_path {
        builder = builder.pdfium_lib_path(dir);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--set KEY=VALUE` pairs. VALUE is JSON when it parses as JSON,
/// otherwise a plain string.
fn parse_assignments(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut fields = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("Expected KEY=VALUE, got '{pair}'"))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("Empty key in '{}'", pair);
        }
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}
