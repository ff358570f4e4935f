//! Pass 2: one extraction call per cluster on a fixed-size worker pool.
//!
//! ## Why a queue instead of `buffer_unordered`?
//!
//! Workers pull cluster indices from a shared queue, so the pool size is the
//! hard bound on in-flight model calls and a slow cluster never blocks the
//! others. Every worker is a plain future borrowed from this stack frame and
//! driven by `join_all`; nothing is spawned and nothing outlives the pass.
//!
//! A failed cluster is recorded as a [`ClusterFailure`] and never aborts the
//! pass. Only cancellation does.

use super::llm::{call_model, ExtractionModel, ModelRequest};
use super::parse::parse_record;
use crate::config::PipelineConfig;
use crate::error::{CallError, ClusterFailure, ReportError};
use crate::model::{truncate_chars, CandidateCluster, ExtractionRecord, Page};
use crate::ocr::page_marker;
use crate::progress::{Phase, PhaseEvent, ProgressEmitter};
use crate::prompts::{extraction_system_prompt, extraction_user_prompt};
use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Progress sub-range covered by Pass 2.
pub const PROGRESS_START: u8 = 40;
pub const PROGRESS_END: u8 = 75;

/// Allowed Pass 2 pool sizes.
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 4;

/// Pass 2 result, in cluster order.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    pub records: Vec<ExtractionRecord>,
    pub failures: Vec<ClusterFailure>,
    pub clusters_total: usize,
}

/// Scale `done / total` into the Pass 2 progress range.
pub fn scaled_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return PROGRESS_END;
    }
    let span = (PROGRESS_END - PROGRESS_START) as usize;
    PROGRESS_START + (span * done.min(total) / total) as u8
}

/// Marker-annotated text of the cluster's pages, capped at `budget` chars.
pub fn cluster_text(pages: &[Page], cluster: &CandidateCluster, budget: usize) -> String {
    let mut out = String::new();
    for number in &cluster.pages {
        if let Some(page) = pages.iter().find(|p| p.number == *number) {
            out.push_str(&page_marker(page.number));
            out.push('\n');
            out.push_str(page.text.trim_end());
            out.push_str("\n\n");
        }
    }
    truncate_chars(&out, budget)
}

/// Restrict the record to the cluster's pages; an uncited record inherits them.
pub fn scope_record(mut record: ExtractionRecord, cluster: &CandidateCluster) -> ExtractionRecord {
    record.source_pages.retain(|p| cluster.pages.contains(p));
    record.source_pages.sort_unstable();
    record.source_pages.dedup();
    if record.source_pages.is_empty() {
        record.source_pages = cluster.pages.clone();
    }
    record.quotes.retain(|q| cluster.pages.contains(&q.page));
    record
}

async fn extract_one(
    cluster: &CandidateCluster,
    pages: &[Page],
    model: &dyn ExtractionModel,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> Result<ExtractionRecord, CallError> {
    let request = ModelRequest {
        system: extraction_system_prompt(),
        user: extraction_user_prompt(
            cluster,
            &cluster_text(pages, cluster, config.cluster_char_budget),
        ),
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    };
    let reply = call_model(model, &request, config.call_timeout(), cancel).await?;
    parse_record(&reply.content).map(|r| scope_record(r, cluster))
}

/// Run Pass 2 over `clusters` with `config.workers` workers.
pub async fn extract_clusters(
    clusters: &[CandidateCluster],
    pages: &[Page],
    model: &dyn ExtractionModel,
    config: &PipelineConfig,
    emitter: &ProgressEmitter,
    cancel: &CancellationToken,
) -> Result<ExtractionOutcome, ReportError> {
    let total = clusters.len();
    let workers = config
        .workers
        .clamp(MIN_WORKERS, MAX_WORKERS)
        .min(total.max(1));
    info!("Extracting {} clusters with {} workers", total, workers);
    emitter
        .phase(PhaseEvent::new(Phase::Pass2, "start").total(total))
        .await;

    let queue: Mutex<VecDeque<usize>> = Mutex::new((0..total).collect());
    let results: Mutex<Vec<(usize, Result<ExtractionRecord, CallError>)>> =
        Mutex::new(Vec::with_capacity(total));
    let done = AtomicUsize::new(0);

    let worker = |id: usize| {
        let queue = &queue;
        let results = &results;
        let done = &done;
        async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(i) = queue.lock().await.pop_front() else {
                    break;
                };
                let cluster = &clusters[i];
                debug!("worker {} takes cluster {}", id, i + 1);
                emitter
                    .phase(PhaseEvent::new(Phase::Pass2, "cluster:start").cluster(i + 1, &cluster.title))
                    .await;

                let outcome = extract_one(cluster, pages, model, config, cancel).await;
                let event = match &outcome {
                    Ok(_) => PhaseEvent::new(Phase::Pass2, "cluster:done"),
                    Err(e) => PhaseEvent::new(Phase::Pass2, "cluster:fail").reason(e.to_string()),
                };
                emitter.phase(event.cluster(i + 1, &cluster.title)).await;
                results.lock().await.push((i, outcome));

                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                emitter
                    .step(
                        "extracting",
                        scaled_progress(finished, total),
                        format!("{finished}/{total} clusters processed"),
                    )
                    .await;
            }
        }
    };
    join_all((0..workers).map(worker)).await;

    if cancel.is_cancelled() {
        return Err(ReportError::Cancelled {
            stage: "extracting".into(),
        });
    }

    let mut results = results.into_inner();
    results.sort_by_key(|(i, _)| *i);
    let mut outcome = ExtractionOutcome {
        clusters_total: total,
        ..Default::default()
    };
    for (i, result) in results {
        match result {
            Ok(record) => outcome.records.push(record),
            Err(e) => outcome.failures.push(ClusterFailure {
                index: i + 1,
                title: clusters[i].title.clone(),
                error: e.to_string(),
            }),
        }
    }
    info!(
        "Pass 2 finished: {} records, {} failures",
        outcome.records.len(),
        outcome.failures.len()
    );
    emitter
        .phase(
            PhaseEvent::new(Phase::Pass2, "done")
                .total(total)
                .reason(format!("{} failed", outcome.failures.len())),
        )
        .await;
    Ok(outcome)
}
