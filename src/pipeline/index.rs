//! Pass 1: group pages into candidate clusters.
//!
//! One model call proposes clusters. The model is allowed to fail in any
//! way (error, timeout, garbage, an empty list): the indexer then falls back
//! to fixed windows of consecutive pages, which always cover the document.

use super::llm::{call_model, ExtractionModel, ModelRequest};
use super::parse::{parse_clusters, PageRef, RawCluster};
use crate::config::PipelineConfig;
use crate::error::{CallError, ReportError};
use crate::model::{truncate_chars, CandidateCluster};
use crate::ocr::OcrOutput;
use crate::progress::{Phase, PhaseEvent, ProgressEmitter};
use crate::prompts::INDEX_SYSTEM_PROMPT;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Allowed fallback window sizes.
pub const MIN_WINDOW: usize = 6;
pub const MAX_WINDOW: usize = 12;

/// Pass 1 result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOutcome {
    pub clusters: Vec<CandidateCluster>,
    /// Why the fallback partition was used, if it was.
    pub fallback_reason: Option<String>,
}

impl IndexOutcome {
    pub fn used_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

/// Contiguous windows of `window` pages (clamped) titled "Cluster k".
///
/// Every page in `1..=page_count` lands in exactly one cluster.
pub fn fallback_partition(page_count: usize, window: usize) -> Vec<CandidateCluster> {
    let window = window.clamp(MIN_WINDOW, MAX_WINDOW);
    (1..=page_count)
        .collect::<Vec<_>>()
        .chunks(window)
        .enumerate()
        .map(|(i, pages)| CandidateCluster {
            title: format!("Cluster {}", i + 1),
            pages: pages.to_vec(),
            reason: format!("pages {}-{} (fixed window)", pages[0], pages[pages.len() - 1]),
        })
        .collect()
}

/// Keep in-range pages, dedup and sort; drop clusters left empty.
pub fn sanitize_clusters(raw: Vec<RawCluster>, page_count: usize) -> Vec<CandidateCluster> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(i, c)| {
            let pages: BTreeSet<usize> = c
                .pages
                .iter()
                .flat_map(PageRef::expand)
                .filter(|p| *p <= page_count)
                .collect();
            if pages.is_empty() {
                return None;
            }
            let title = c.title.trim();
            Some(CandidateCluster {
                title: if title.is_empty() {
                    format!("Cluster {}", i + 1)
                } else {
                    title.to_string()
                },
                pages: pages.into_iter().collect(),
                reason: c.reason.trim().to_string(),
            })
        })
        .collect()
}

/// Run Pass 1.
pub async fn index_pages(
    ocr: &OcrOutput,
    model: &dyn ExtractionModel,
    config: &PipelineConfig,
    emitter: &ProgressEmitter,
    cancel: &CancellationToken,
) -> Result<IndexOutcome, ReportError> {
    let page_count = ocr.page_count();
    if page_count == 0 {
        return Err(ReportError::Boundary("OCR returned zero pages".into()));
    }
    emitter.phase(PhaseEvent::new(Phase::Pass1, "start").total(page_count)).await;

    let request = ModelRequest {
        system: INDEX_SYSTEM_PROMPT.to_string(),
        user: truncate_chars(&ocr.combined_text, config.index_char_budget),
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    };
    let proposed = match call_model(model, &request, config.call_timeout(), cancel).await {
        Err(CallError::Cancelled) => {
            return Err(ReportError::Cancelled {
                stage: "indexing".into(),
            })
        }
        Err(e) => Err(e),
        Ok(reply) => parse_clusters(&reply.content),
    };

    let fallback_reason = match proposed {
        Ok(raw) => {
            let clusters = sanitize_clusters(raw, page_count);
            if !clusters.is_empty() {
                info!("Indexer proposed {} clusters", clusters.len());
                emitter
                    .phase(PhaseEvent::new(Phase::Pass1, "done").total(clusters.len()))
                    .await;
                return Ok(IndexOutcome {
                    clusters,
                    fallback_reason: None,
                });
            }
            "indexer returned no usable clusters".to_string()
        }
        Err(e) => e.to_string(),
    };

    warn!("Indexer fallback: {}", fallback_reason);
    let clusters = fallback_partition(page_count, config.cluster_window);
    emitter
        .phase(
            PhaseEvent::new(Phase::Pass1, "fallback")
                .total(clusters.len())
                .reason(fallback_reason.clone()),
        )
        .await;
    Ok(IndexOutcome {
        clusters,
        fallback_reason: Some(fallback_reason),
    })
}
