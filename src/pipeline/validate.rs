//! Pass 4: ask the model which mandatory fields the report is missing.
//!
//! Purely additive. Whatever goes wrong here (timeout, provider error,
//! cancellation) the report from Pass 3 stands unchanged.

use super::llm::{call_model, ExtractionModel, ModelRequest};
use super::postprocess::strip_markdown_fences;
use crate::config::PipelineConfig;
use crate::progress::{LogLevel, Phase, PhaseEvent, ProgressEmitter};
use crate::prompts::{validation_system_prompt, NO_ADDENDUM_MARKER};
use tokio_util::sync::CancellationToken;

/// Turn the validator's reply into an addendum, if one is needed.
pub fn interpret_reply(reply: &str) -> Option<String> {
    let text = strip_markdown_fences(reply);
    let text = text.trim();
    let bare = text.trim_matches(|c: char| c == '.' || c == '`' || c == '*' || c.is_whitespace());
    if bare.is_empty() || bare == NO_ADDENDUM_MARKER {
        None
    } else {
        Some(text.to_string())
    }
}

/// Run Pass 4. Returns the addendum, or `None` on "nothing missing" or any failure.
pub async fn validate_report(
    body: &str,
    model: &dyn ExtractionModel,
    config: &PipelineConfig,
    emitter: &ProgressEmitter,
    cancel: &CancellationToken,
) -> Option<String> {
    emitter.phase(PhaseEvent::new(Phase::Pass4, "start")).await;
    let request = ModelRequest {
        system: validation_system_prompt(),
        user: body.to_string(),
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    };
    match call_model(model, &request, config.call_timeout(), cancel).await {
        Ok(reply) => {
            let addendum = interpret_reply(&reply.content);
            let status = if addendum.is_some() { "addendum" } else { "complete" };
            emitter.phase(PhaseEvent::new(Phase::Pass4, status)).await;
            addendum
        }
        Err(e) => {
            emitter
                .log(LogLevel::Warn, format!("Validation skipped: {e}"), None)
                .await;
            emitter
                .phase(PhaseEvent::new(Phase::Pass4, "skipped").reason(e.to_string()))
                .await;
            None
        }
    }
}
