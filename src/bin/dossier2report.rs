//! CLI binary for dossier-report.
//!
//! A thin shim over the library crate: maps flags to `PipelineConfig`,
//! streams NDJSON progress events and writes the final report.

use anyhow::{Context, Result};
use clap::Parser;
use dossier_report::{
    spawn_job, write_ndjson, Collaborators, JobRequest, PipelineConfig, ProgressEvent, SourceRef,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
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

// ── Progress bar driven by the event stream ──────────────────────────────────

/// Renders `step` events as a 0–100 bar and cluster failures as log lines.
struct EventBar {
    bar: ProgressBar,
}

impl EventBar {
    fn new() -> Self {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}%  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("created");
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    fn observe(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Step(step) => {
                self.bar.set_prefix(step.step.clone());
                self.bar.set_position(step.progress as u64);
                self.bar.set_message(step.message.clone());
            }
            ProgressEvent::Phase(phase) if phase.status == "cluster:fail" => {
                self.bar.println(format!(
                    "  {} Cluster {} {}  {}",
                    red("✗"),
                    phase.cluster.unwrap_or_default(),
                    phase.title.as_deref().unwrap_or_default(),
                    dim(phase.reason.as_deref().unwrap_or_default()),
                ));
            }
            ProgressEvent::Phase(phase) if phase.status == "fallback" => {
                self.bar.println(format!(
                    "  {} Indexer fallback: {}",
                    cyan("⚠"),
                    phase.reason.as_deref().unwrap_or_default()
                ));
            }
            ProgressEvent::Result { .. } | ProgressEvent::Error(_) => self.bar.finish_and_clear(),
            _ => {}
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Local scan, events on stdout, report to a file
  dossier2report dossier.pdf -o report.md

  # Remote source through a fetch proxy, events to a file
  dossier2report https://files.example.org/d/123.pdf --proxy-url https://proxy.example.org/fetch \
      --events events.ndjson -o report.md

  # Document already in the bucket
  dossier2report gs://my-bucket/incoming/dossier.pdf --file-name dossier.pdf -o report.md

EVENT STREAM (one JSON object per line):
  {"step": "...", "progress": 0-100, "message": "..."}
  {"phase": "pass1".."pass4", "status": "...", ...}
  {"log": {"level": "info|warn|error", "message": "...", "timestamp": "..."}}
  {"result": {"fileName", "totalPages", "extractedData", "processingMethod", "timestamp"}}
  {"step": "Error", "message": "...", "error": true}

ENVIRONMENT VARIABLES:
  DOSSIER_GCS_BUCKET         Bucket for uploads and OCR output (required)
  DOSSIER_GCP_ACCESS_TOKEN   OAuth bearer token for Cloud Storage and Document AI (required)
  DOSSIER_DOCAI_PROJECT      Document AI project id (required)
  DOSSIER_DOCAI_PROCESSOR    Document AI OCR processor id (required)
  DOSSIER_DOCAI_LOCATION     Processor region (default: eu)
  DOSSIER_SIGNED_URL_ENDPOINT  URL signer used when a direct upload is rejected
  DOSSIER_SIGNER_TOKEN       Bearer token for the URL signer
  OPENAI_API_KEY             OpenAI API key
  ANTHROPIC_API_KEY          Anthropic API key
  EDGEQUAKE_LLM_PROVIDER     Override provider (openai, anthropic, gemini, ollama)
"#;

/// Turn a scanned PDF dossier into a cited narrative report.
#[derive(Parser, Debug)]
#[command(
    name = "dossier2report",
    version,
    about = "Turn a scanned PDF dossier into a cited narrative report",
    long_about = "Upload a scanned dossier, OCR it, and run a four-pass LLM pipeline \
(index, extract, consolidate, validate) that produces a Markdown report citing source pages. \
Progress is streamed as line-delimited JSON.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF path, HTTP/HTTPS URL, or gs:// URI.
    input: String,

    /// File name recorded in the report (default: last path segment of the input).
    #[arg(long)]
    file_name: Option<String>,

    /// Write the final Markdown report to this file.
    #[arg(short, long, env = "DOSSIER_OUTPUT")]
    output: Option<PathBuf>,

    /// Write NDJSON progress events to this file instead of stdout.
    #[arg(long, env = "DOSSIER_EVENTS")]
    events: Option<PathBuf>,

    /// Model for indexing, extraction, validation and the first report attempt.
    #[arg(long, env = "DOSSIER_PRIMARY_MODEL", default_value = "gpt-4.1-nano")]
    primary_model: String,

    /// Model for the report retry with compacted records.
    #[arg(long, env = "DOSSIER_FALLBACK_MODEL", default_value = "gpt-4.1-mini")]
    fallback_model: String,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "DOSSIER_LLM_PROVIDER")]
    provider: Option<String>,

    /// Concurrent extraction workers (1–4).
    #[arg(short, long, env = "DOSSIER_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Pages per cluster when the indexer falls back to fixed windows (6–12).
    #[arg(long, env = "DOSSIER_CLUSTER_WINDOW", default_value_t = 10)]
    cluster_window: usize,

    /// Per-call model timeout in seconds (clamped to 30–240).
    #[arg(long, env = "DOSSIER_CALL_TIMEOUT_SECS", default_value_t = 120)]
    call_timeout: u64,

    /// Timeout of the report retry in seconds (clamped to 30–480).
    #[arg(long, env = "DOSSIER_FALLBACK_TIMEOUT_SECS", default_value_t = 300)]
    fallback_timeout: u64,

    /// Per-write storage timeout in seconds.
    #[arg(long, env = "DOSSIER_UPLOAD_TIMEOUT_SECS", default_value_t = 60)]
    upload_timeout: u64,

    /// Source download timeout in seconds.
    #[arg(long, env = "DOSSIER_DOWNLOAD_TIMEOUT_SECS", default_value_t = 120)]
    download_timeout: u64,

    /// Fetch proxy used when the source cannot be downloaded directly.
    #[arg(long, env = "DOSSIER_PROXY_URL")]
    proxy_url: Option<String>,

    /// Disable progress bar.
    #[arg(long, env = "DOSSIER_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOSSIER_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOSSIER_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The bar replaces INFO logs; both go to stderr, stdout carries events.
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

    // ── Build config and collaborators ───────────────────────────────────
    let config = Arc::new(build_config(&cli)?);
    let collaborators =
        Collaborators::from_env(&config).context("Failed to configure cloud services")?;

    let source = SourceRef::parse(&cli.input);
    let file_name = cli
        .file_name
        .clone()
        .unwrap_or_else(|| default_file_name(&cli.input));
    let request = JobRequest::new(source, file_name);

    // ── Run the job ──────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let (events, handle) = spawn_job(request, Arc::clone(&config), collaborators, cancel);
    let bar = show_progress.then(EventBar::new);
    let events = events.inspect(|event| {
        if let Some(bar) = &bar {
            bar.observe(event);
        }
    });

    let writer: Box<dyn AsyncWrite + Unpin + Send> = match &cli.events {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };
    write_ndjson(events, writer)
        .await
        .context("Failed to write progress events")?;

    let outcome = handle
        .await
        .context("Job task panicked")?
        .context("Report generation failed")?;

    // ── Write report ─────────────────────────────────────────────────────
    let report = outcome.report.render();
    if let Some(ref path) = cli.output {
        tokio::fs::write(path, report.as_bytes())
            .await
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    } else if cli.events.is_some() {
        print!("{report}");
    }

    if !cli.quiet {
        let failed = outcome.failures.len();
        eprintln!(
            "{}  {} pages  {}/{} clusters  {}  {}ms{}",
            if failed == 0 { green("✔") } else { cyan("⚠") },
            outcome.total_pages,
            outcome.clusters_succeeded,
            outcome.clusters_total,
            dim(&outcome.processing_method),
            outcome.timings.total_ms,
            cli.output
                .as_ref()
                .map(|p| format!("  →  {}", bold(&p.display().to_string())))
                .unwrap_or_default(),
        );
        for failure in &outcome.failures {
            eprintln!("   {} {}", red("✗"), failure);
        }
    }

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .primary_model(cli.primary_model.clone())
        .fallback_model(cli.fallback_model.clone())
        .workers(cli.workers)
        .cluster_window(cli.cluster_window)
        .call_timeout_secs(cli.call_timeout)
        .fallback_timeout_secs(cli.fallback_timeout)
        .upload_timeout_secs(cli.upload_timeout)
        .download_timeout_secs(cli.download_timeout);
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref proxy) = cli.proxy_url {
        builder = builder.proxy_url(proxy.clone());
    }
    builder.build().context("Invalid configuration")
}

/// Last path segment of a URL, URI or path; `document.pdf` if there is none.
fn default_file_name(input: &str) -> String {
    let trimmed = input.split(['?', '#']).next().unwrap_or(input);
    trimmed
        .rsplit(['/', '\\'])
        .find(|s| !s.is_empty())
        .filter(|s| !s.contains(':'))
        .map(str::to_string)
        .unwrap_or_else(|| "document.pdf".to_string())
}
