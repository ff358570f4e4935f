//! Job runner: the single entry point that drives one dossier to a report.
//!
//! ## Why one top-level handler?
//!
//! Stages only ever return `Result`. [`run_job`] is the one place that
//! turns a stage error into the terminal `error` event, and the one place
//! that runs Cleanup. Since the handler owns the [`ProgressEmitter`] and
//! `finish` consumes it, every job ends with exactly one terminal event,
//! sent after Cleanup has finished.

use crate::config::PipelineConfig;
use crate::error::{ClusterFailure, ReportError};
use crate::job::{Job, JobContext, JobId, JobRequest, JobState};
use crate::model::Report;
use crate::ocr::{DocumentAiOcr, DocumentAiSettings, OcrEngine, OcrOutput};
use crate::pipeline::cleanup::cleanup;
use crate::pipeline::consolidate::{consolidate, ConsolidationInput};
use crate::pipeline::extract::{extract_clusters, PROGRESS_START};
use crate::pipeline::index::index_pages;
use crate::pipeline::ingest::ingest;
use crate::pipeline::llm::ModelSet;
use crate::pipeline::validate::validate_report;
use crate::progress::{EventStream, LogLevel, ProgressEmitter, ResultPayload, Terminal};
use crate::storage::{GcsSettings, GcsStore, ObjectStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Optional persistence of finished reports.
///
/// Called fire-and-forget after a successful job; the pipeline never waits
/// for it and its failures only reach the log.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save_result(&self, outcome: &JobOutcome) -> Result<(), ReportError>;
}

/// External services a job talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ObjectStore>,
    pub ocr: Arc<dyn OcrEngine>,
    pub models: ModelSet,
    pub sink: Option<Arc<dyn ResultSink>>,
}

impl Collaborators {
    pub fn new(store: Arc<dyn ObjectStore>, ocr: Arc<dyn OcrEngine>, models: ModelSet) -> Self {
        Self {
            store,
            ocr,
            models,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Production wiring: Cloud Storage, Document AI and the configured LLM.
    pub fn from_env(config: &PipelineConfig) -> Result<Self, ReportError> {
        let store: Arc<dyn ObjectStore> = Arc::new(GcsStore::new(GcsSettings::from_env()?)?);
        let ocr = DocumentAiOcr::new(DocumentAiSettings::from_env()?, Arc::clone(&store))?;
        let models = ModelSet::from_config(config)?;
        Ok(Self::new(store, Arc::new(ocr), models))
    }
}

/// Wall-clock time spent per stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimings {
    pub ingest_ms: u64,
    pub ocr_ms: u64,
    pub index_ms: u64,
    pub extract_ms: u64,
    pub consolidate_ms: u64,
    pub validate_ms: u64,
    pub cleanup_ms: u64,
    pub total_ms: u64,
}

/// Everything known about a successful job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub job_id: JobId,
    pub file_name: String,
    pub total_pages: usize,
    pub report: Report,
    pub processing_method: String,
    pub consolidation_attempts: usize,
    /// Set when Pass 1 fell back to fixed windows.
    pub index_fallback: Option<String>,
    pub clusters_total: usize,
    pub clusters_succeeded: usize,
    pub failures: Vec<ClusterFailure>,
    /// `direct` or `signed-url`; `None` for stored sources.
    pub upload_path: Option<String>,
    pub cleanup_failures: usize,
    pub timings: StageTimings,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    fn result_payload(&self) -> ResultPayload {
        ResultPayload {
            file_name: self.file_name.clone(),
            total_pages: self.total_pages,
            extracted_data: self.report.render(),
            processing_method: self.processing_method.clone(),
            timestamp: self.finished_at,
        }
    }
}

/// What the stages produced before Cleanup.
struct Staged {
    total_pages: usize,
    report: Report,
    processing_method: String,
    consolidation_attempts: usize,
    index_fallback: Option<String>,
    clusters_total: usize,
    clusters_succeeded: usize,
    failures: Vec<ClusterFailure>,
    upload_path: Option<String>,
}

fn ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Race a stage against cancellation and consumer disconnect.
async fn guarded<T, F>(
    stage: JobState,
    emitter: &ProgressEmitter,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, ReportError>
where
    F: Future<Output = Result<T, ReportError>>,
{
    let cancelled = || ReportError::Cancelled {
        stage: stage.as_str().to_string(),
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(cancelled()),
        _ = emitter.closed() => {
            warn!("Progress consumer disconnected during {}", stage);
            cancel.cancel();
            Err(cancelled())
        }
        r = fut => r,
    }
}

/// Move the job forward and announce it.
async fn enter(
    job: &mut Job,
    emitter: &ProgressEmitter,
    state: JobState,
    progress: u8,
    message: &str,
) -> Result<(), ReportError> {
    job.advance(state)?;
    emitter.state(state, progress, message).await;
    Ok(())
}

/// Record the OCR prefix only if the engine actually wrote something there.
async fn record_ocr_artifacts(ctx: &mut JobContext, store: &dyn ObjectStore, limit: Duration) {
    let prefix = ctx.keys.ocr_output_prefix();
    match tokio::time::timeout(limit, store.list(&prefix)).await {
        Ok(Ok(keys)) if keys.is_empty() => debug!("No OCR output under {}", prefix),
        Ok(Ok(keys)) => {
            debug!("{} OCR output objects under {}", keys.len(), prefix);
            ctx.record_ocr_output(prefix);
        }
        // Unknown state: target the prefix anyway, deleting an empty prefix is a no-op.
        Ok(Err(e)) => {
            warn!("Listing OCR output failed: {}", e);
            ctx.record_ocr_output(prefix);
        }
        Err(_) => {
            warn!("Listing OCR output timed out");
            ctx.record_ocr_output(prefix);
        }
    }
}

async fn run_stages(
    job: &mut Job,
    ctx: &mut JobContext,
    config: &PipelineConfig,
    collab: &Collaborators,
    emitter: &ProgressEmitter,
    cancel: &CancellationToken,
    timings: &mut StageTimings,
) -> Result<Staged, ReportError> {
    let store = collab.store.as_ref();
    let request = job.request.clone();

    // ── Step 1: Ingest ───────────────────────────────────────────────────
    enter(job, emitter, JobState::Uploading, 5, "Uploading source document").await?;
    let started = Instant::now();
    let ingested = guarded(
        JobState::Uploading,
        emitter,
        cancel,
        ingest(&request, ctx, store, config),
    )
    .await?;
    timings.ingest_ms = ms(started);

    // ── Step 2: OCR ──────────────────────────────────────────────────────
    enter(job, emitter, JobState::OcrRunning, 15, "Running OCR").await?;
    let started = Instant::now();
    let prefix = ctx.keys.ocr_output_prefix();
    let pages = guarded(JobState::OcrRunning, emitter, cancel, async {
        collab
            .ocr
            .run_ocr(&ingested.input_uri, &prefix)
            .await
            .map_err(|e| ReportError::Ocr(e.to_string()))
    })
    .await;
    record_ocr_artifacts(ctx, store, config.cleanup_timeout()).await;
    let ocr = OcrOutput::from_pages(pages?).map_err(|e| ReportError::Ocr(e.to_string()))?;
    timings.ocr_ms = ms(started);
    if ocr.page_count() == 0 {
        return Err(ReportError::Boundary("OCR returned zero pages".into()));
    }
    emitter
        .log(
            LogLevel::Info,
            format!("OCR complete: {} pages", ocr.page_count()),
            Some(json!({ "pages": ocr.page_count(), "chars": ocr.combined_text.len() })),
        )
        .await;

    // ── Step 3: Pass 1 ───────────────────────────────────────────────────
    enter(job, emitter, JobState::Indexing, 30, "Indexing pages").await?;
    let started = Instant::now();
    let primary = collab.models.primary.as_ref();
    let index = guarded(
        JobState::Indexing,
        emitter,
        cancel,
        index_pages(&ocr, primary, config, emitter, cancel),
    )
    .await?;
    timings.index_ms = ms(started);

    // ── Step 4: Pass 2 ───────────────────────────────────────────────────
    enter(
        job,
        emitter,
        JobState::Extracting,
        PROGRESS_START,
        &format!("Extracting {} clusters", index.clusters.len()),
    )
    .await?;
    let started = Instant::now();
    let extraction = guarded(
        JobState::Extracting,
        emitter,
        cancel,
        extract_clusters(&index.clusters, &ocr.pages, primary, config, emitter, cancel),
    )
    .await?;
    timings.extract_ms = ms(started);
    if extraction.records.is_empty() {
        emitter
            .log(
                LogLevel::Warn,
                "No extraction records; consolidating an empty record set",
                Some(json!({ "failures": extraction.failures.len() })),
            )
            .await;
    }

    // ── Step 5: Pass 3 ───────────────────────────────────────────────────
    enter(job, emitter, JobState::Consolidating, 80, "Writing report").await?;
    let started = Instant::now();
    let input = ConsolidationInput {
        file_name: &request.file_name,
        total_pages: ocr.page_count(),
        report_date: Utc::now().date_naive(),
        records: &extraction.records,
    };
    let consolidated = guarded(
        JobState::Consolidating,
        emitter,
        cancel,
        consolidate(input, &collab.models, config, emitter, cancel),
    )
    .await?;
    timings.consolidate_ms = ms(started);

    // ── Step 6: Pass 4 ───────────────────────────────────────────────────
    enter(job, emitter, JobState::Validating, 90, "Checking coverage").await?;
    let started = Instant::now();
    let addendum = validate_report(&consolidated.body, primary, config, emitter, cancel).await;
    timings.validate_ms = ms(started);

    Ok(Staged {
        total_pages: ocr.page_count(),
        report: Report {
            body: consolidated.body,
            addendum,
        },
        processing_method: consolidated.method,
        consolidation_attempts: consolidated.attempts,
        index_fallback: index.fallback_reason,
        clusters_total: extraction.clusters_total,
        clusters_succeeded: extraction.records.len(),
        failures: extraction.failures,
        upload_path: ingested.upload_path.map(|p| p.as_str().to_string()),
    })
}

/// Run one job to completion.
///
/// Always emits exactly one terminal event as the last event on `emitter`'s
/// stream and always runs Cleanup once, whichever stage failed.
pub async fn run_job(
    request: JobRequest,
    config: &PipelineConfig,
    collab: &Collaborators,
    emitter: ProgressEmitter,
    cancel: CancellationToken,
) -> Result<JobOutcome, ReportError> {
    let total_start = Instant::now();
    let mut job = Job::new(request);
    let mut ctx = JobContext::new(job.id);
    info!("Starting job {} for '{}'", job.id, job.request.file_name);
    emitter
        .state(JobState::Created, 0, format!("Job {} created", job.id))
        .await;

    let mut timings = StageTimings::default();
    let result = run_stages(
        &mut job,
        &mut ctx,
        config,
        collab,
        &emitter,
        &cancel,
        &mut timings,
    )
    .await;

    // ── Cleanup: once, on every path ─────────────────────────────────────
    if let Err(e) = job.advance(JobState::CleaningUp) {
        warn!("{}", e);
    }
    emitter
        .state(JobState::CleaningUp, 95, "Removing intermediate files")
        .await;
    let started = Instant::now();
    let cleaned = cleanup(&ctx, collab.store.as_ref(), config.cleanup_timeout()).await;
    timings.cleanup_ms = ms(started);
    timings.total_ms = ms(total_start);

    match result {
        Ok(staged) => {
            if let Err(e) = job.advance(JobState::Done) {
                warn!("{}", e);
            }
            let outcome = JobOutcome {
                job_id: job.id,
                file_name: job.request.file_name.clone(),
                total_pages: staged.total_pages,
                report: staged.report,
                processing_method: staged.processing_method,
                consolidation_attempts: staged.consolidation_attempts,
                index_fallback: staged.index_fallback,
                clusters_total: staged.clusters_total,
                clusters_succeeded: staged.clusters_succeeded,
                failures: staged.failures,
                upload_path: staged.upload_path,
                cleanup_failures: cleaned.failed,
                timings,
                finished_at: Utc::now(),
            };
            info!(
                "Job {} done: {} pages, {}/{} clusters, {} in {}ms",
                outcome.job_id,
                outcome.total_pages,
                outcome.clusters_succeeded,
                outcome.clusters_total,
                outcome.processing_method,
                timings.total_ms
            );
            emitter.state(JobState::Done, 100, "Report ready").await;
            emitter
                .finish(Terminal::Result(outcome.result_payload()))
                .await;

            if let Some(sink) = &collab.sink {
                let sink = Arc::clone(sink);
                let saved = outcome.clone();
                tokio::spawn(async move {
                    if let Err(e) = sink.save_result(&saved).await {
                        warn!("Saving result of job {} failed: {}", saved.job_id, e);
                    }
                });
            }
            Ok(outcome)
        }
        Err(e) => {
            if let Err(err) = job.advance(JobState::Failed) {
                warn!("{}", err);
            }
            warn!("Job {} failed: {}", job.id, e);
            emitter.finish(Terminal::Error(e.to_string())).await;
            Err(e)
        }
    }
}

/// Spawn a job and hand back its event stream.
pub fn spawn_job(
    request: JobRequest,
    config: Arc<PipelineConfig>,
    collab: Collaborators,
    cancel: CancellationToken,
) -> (EventStream, JoinHandle<Result<JobOutcome, ReportError>>) {
    let (emitter, events) = ProgressEmitter::channel(config.event_buffer);
    let handle = tokio::spawn(async move { run_job(request, &config, &collab, emitter, cancel).await });
    (events, handle)
}
