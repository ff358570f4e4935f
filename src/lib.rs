//! # dossier-report
//!
//! Turn a scanned PDF dossier (legal or administrative case files) into a
//! structured, page-cited narrative report.
//!
//! ## Why a staged pipeline?
//!
//! A single "summarise this 200-page scan" prompt loses facts, invents
//! citations and fails as a whole when one call times out. Splitting the
//! work into small, schema-checked model calls keeps every fact tied to the
//! pages it came from, and lets each stage degrade on its own: the indexer
//! falls back to fixed page windows, a failed cluster is recorded instead of
//! sinking the job, the report is retried once with a smaller payload, and
//! the coverage check is optional.
//!
//! ## Pipeline Overview
//!
//! ```text
//! source (URL / gs:// / file)
//!  │
//!  ├─ Ingest   probe bucket, upload (direct → signed URL)
//!  ├─ OCR      Document AI batch job → pages 1..N
//!  ├─ Pass 1   index pages into candidate clusters (fallback: fixed windows)
//!  ├─ Pass 2   per-cluster extraction on a bounded worker pool
//!  ├─ Pass 3   consolidate records into the report (retry: fallback model, compacted)
//!  ├─ Pass 4   coverage check → optional addendum
//!  └─ Cleanup  delete every object the job created
//! ```
//!
//! Progress is streamed as [`ProgressEvent`]s; the last event is always
//! exactly one `result` or `error`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dossier_report::{spawn_job, write_ndjson, Collaborators, JobRequest, PipelineConfig, SourceRef};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(PipelineConfig::from_env()?);
//!     let collaborators = Collaborators::from_env(&config)?;
//!     let request = JobRequest::new(SourceRef::parse("dossier.pdf"), "dossier.pdf");
//!
//!     let (events, job) = spawn_job(request, config, collaborators, CancellationToken::new());
//!     write_ndjson(events, tokio::io::stdout()).await?;
//!     let outcome = job.await??;
//!     println!("{}", outcome.report.render());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `dossier2report` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod job;
pub mod model;
pub mod ocr;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod runner;
pub mod storage;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder, TimeoutPolicy};
pub use error::{CallError, ClusterFailure, ReportError};
pub use job::{JobContext, JobId, JobRequest, JobState, SourceRef};
pub use model::{CandidateCluster, ExtractionRecord, Page, Report, NOT_STATED};
pub use ocr::{OcrEngine, OcrError, OcrOutput};
pub use pipeline::llm::{ExtractionModel, ModelReply, ModelRequest, ModelSet};
pub use progress::{EventStream, ProgressEmitter, ProgressEvent, Terminal};
pub use runner::{run_job, spawn_job, Collaborators, JobOutcome, ResultSink, StageTimings};
pub use storage::{ObjectStore, StoreError, UploadPath};
pub use stream::write_ndjson;
