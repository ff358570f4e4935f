//! Pass 3: merge extraction records into the narrative report.
//!
//! Two attempts, expressed as [`AttemptStrategy`] values: the primary model
//! with the full records, then the fallback model with a longer timeout and
//! compacted records. The compacted payload is always strictly smaller: it
//! is serialised without pretty-printing, on top of field truncation and
//! quote thinning.

use super::llm::{call_model, ModelRequest, ModelSet};
use super::postprocess::clean_report;
use super::retry::{try_with_fallbacks, AttemptStrategy, Payload};
use crate::config::PipelineConfig;
use crate::error::{CallError, ReportError};
use crate::model::ExtractionRecord;
use crate::progress::{Phase, PhaseEvent, ProgressEmitter};
use crate::prompts::{consolidation_system_prompt, consolidation_user_prompt};
use chrono::NaiveDate;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything Pass 3 needs to know about the job.
#[derive(Debug, Clone, Copy)]
pub struct ConsolidationInput<'a> {
    pub file_name: &'a str,
    pub total_pages: usize,
    pub report_date: NaiveDate,
    pub records: &'a [ExtractionRecord],
}

/// Accepted Pass 3 output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consolidated {
    /// Cleaned Markdown, header included.
    pub body: String,
    /// Label of the winning attempt.
    pub method: String,
    pub attempts: usize,
}

/// Primary-then-fallback strategy list.
pub fn strategies(models: &ModelSet, config: &PipelineConfig) -> Vec<AttemptStrategy> {
    vec![
        AttemptStrategy {
            label: format!("primary:{}", models.primary.name()),
            model: Arc::clone(&models.primary),
            timeout: config.call_timeout(),
            payload: Payload::Full,
        },
        AttemptStrategy {
            label: format!("fallback-compacted:{}", models.fallback.name()),
            model: Arc::clone(&models.fallback),
            timeout: config.fallback_timeout(),
            payload: Payload::Compacted,
        },
    ]
}

/// Serialise the records for one attempt.
pub fn records_payload(
    records: &[ExtractionRecord],
    payload: Payload,
    config: &PipelineConfig,
) -> Result<String, ReportError> {
    let json = match payload {
        Payload::Full => serde_json::to_string_pretty(records),
        Payload::Compacted => {
            let compacted: Vec<ExtractionRecord> = records
                .iter()
                .map(|r| r.compacted(config.compact_field_chars, config.compact_quotes))
                .collect();
            serde_json::to_string(&compacted)
        }
    };
    json.map_err(|e| ReportError::Internal(format!("serialising records: {e}")))
}

/// Metadata line placed above the model's report.
pub fn report_header(file_name: &str, total_pages: usize, report_date: NaiveDate) -> String {
    format!(
        "_Source: {file_name} ({total_pages} pages). Report date: {}._",
        report_date.format("%Y-%m-%d")
    )
}

/// Run Pass 3.
pub async fn consolidate(
    input: ConsolidationInput<'_>,
    models: &ModelSet,
    config: &PipelineConfig,
    emitter: &ProgressEmitter,
    cancel: &CancellationToken,
) -> Result<Consolidated, ReportError> {
    let date = input.report_date.format("%Y-%m-%d").to_string();
    let full = records_payload(input.records, Payload::Full, config)?;
    let compacted = records_payload(input.records, Payload::Compacted, config)?;
    emitter
        .phase(PhaseEvent::new(Phase::Pass3, "start").total(input.records.len()))
        .await;

    let plan = strategies(models, config);
    let outcome = try_with_fallbacks(&plan, |strategy| {
        let records_json = match strategy.payload {
            Payload::Full => full.as_str(),
            Payload::Compacted => compacted.as_str(),
        };
        let request = ModelRequest {
            system: consolidation_system_prompt(),
            user: consolidation_user_prompt(
                input.file_name,
                input.total_pages,
                &date,
                records_json,
                strategy.payload == Payload::Compacted,
            ),
            temperature: config.temperature,
            max_tokens: config.report_max_tokens,
        };
        let strategy = strategy.clone();
        async move {
            emitter
                .phase(PhaseEvent::new(Phase::Pass3, "attempt").reason(strategy.label.clone()))
                .await;
            let reply = call_model(strategy.model.as_ref(), &request, strategy.timeout, cancel).await?;
            let body = clean_report(&reply.content);
            if body.trim().is_empty() {
                return Err(CallError::Parse("empty report".into()));
            }
            Ok(body)
        }
    })
    .await;

    match outcome {
        Ok(won) => {
            info!("Consolidated via {} (attempt {})", won.label, won.attempt);
            emitter
                .phase(PhaseEvent::new(Phase::Pass3, "done").reason(won.label.clone()))
                .await;
            Ok(Consolidated {
                body: format!(
                    "{}\n\n{}",
                    report_header(input.file_name, input.total_pages, input.report_date),
                    won.value
                ),
                method: won.label,
                attempts: won.attempt,
            })
        }
        Err(exhausted) => match exhausted.last_error {
            Some(CallError::Cancelled) => Err(ReportError::Cancelled {
                stage: "consolidating".into(),
            }),
            last => Err(ReportError::Consolidation {
                attempts: exhausted.attempts,
                last_error: last.map(|e| e.to_string()).unwrap_or_default(),
            }),
        },
    }
}
