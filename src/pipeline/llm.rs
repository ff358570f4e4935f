//! Model interaction: one text-in, text-out call per pipeline request.
//!
//! Every pass talks to an [`ExtractionModel`]. The production
//! implementation, [`ProviderModel`], wraps an `edgequake_llm` provider;
//! tests substitute scripted models. Timeouts and cancellation are applied
//! uniformly by [`call_model`] so no pass can forget them.
//!
//! Prompt text lives in [`crate::prompts`]; output parsing in
//! [`super::parse`].

use crate::config::PipelineConfig;
use crate::error::{CallError, ReportError};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A single model request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// Raw model output plus token usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelReply {
    pub content: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Anything that can answer a [`ModelRequest`].
#[async_trait]
pub trait ExtractionModel: Send + Sync {
    /// Model identifier used in logs and `processingMethod`.
    fn name(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, CallError>;
}

/// [`ExtractionModel`] backed by an `edgequake_llm` provider.
pub struct ProviderModel {
    provider: Arc<dyn LLMProvider>,
    model: String,
}

impl ProviderModel {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ExtractionModel for ProviderModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, CallError> {
        let messages = vec![
            ChatMessage::system(request.system.as_str()),
            ChatMessage::user(request.user.as_str()),
        ];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };
        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| CallError::Provider(e.to_string()))?;
        Ok(ModelReply {
            content: response.content,
            input_tokens: response.prompt_tokens as usize,
            output_tokens: response.completion_tokens as usize,
        })
    }
}

/// Run one model call under `limit`, short-circuiting on cancellation.
pub async fn call_model(
    model: &dyn ExtractionModel,
    request: &ModelRequest,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<ModelReply, CallError> {
    let start = Instant::now();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CallError::Cancelled),
        r = tokio::time::timeout(limit, model.complete(request)) => match r {
            Ok(inner) => inner,
            Err(_) => Err(CallError::Timeout { secs: limit.as_secs() }),
        },
    };
    match &result {
        Ok(reply) => debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            model.name(),
            reply.input_tokens,
            reply.output_tokens,
            start.elapsed()
        ),
        Err(e) => warn!("{}: call failed after {:?}: {}", model.name(), start.elapsed(), e),
    }
    result
}

/// Primary and fallback models for one job.
#[derive(Clone)]
pub struct ModelSet {
    pub primary: Arc<dyn ExtractionModel>,
    pub fallback: Arc<dyn ExtractionModel>,
}

impl ModelSet {
    pub fn new(primary: Arc<dyn ExtractionModel>, fallback: Arc<dyn ExtractionModel>) -> Self {
        Self { primary, fallback }
    }

    /// Build both models from the configured provider chain.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ReportError> {
        let primary = resolve_provider(config, &config.primary_model)?;
        let fallback = resolve_provider(config, &config.fallback_model)?;
        Ok(Self {
            primary: Arc::new(ProviderModel::new(primary, config.primary_model.clone())),
            fallback: Arc::new(ProviderModel::new(fallback, config.fallback_model.clone())),
        })
    }
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ReportError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ReportError::Configuration(format!("LLM provider '{provider_name}' is not configured: {e}"))
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. pre-built `config.provider`
/// 2. named `config.provider_name`
/// 3. `EDGEQUAKE_LLM_PROVIDER` from the environment
/// 4. OpenAI when `OPENAI_API_KEY` is set
/// 5. `ProviderFactory::from_env` auto-detection
fn resolve_provider(
    config: &PipelineConfig,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, ReportError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let Ok(prov) = std::env::var("EDGEQUAKE_LLM_PROVIDER") {
        if !prov.is_empty() {
            return create_provider(&prov, model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) = ProviderFactory::from_env().map_err(|e| {
        ReportError::Configuration(format!(
            "No LLM provider could be auto-detected from environment.\n\
            Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
            Error: {e}"
        ))
    })?;
    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    #[async_trait]
    impl ExtractionModel for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        async fn complete(&self, _request: &ModelRequest) -> Result<ModelReply, CallError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ModelReply::default())
        }
    }

    struct Echo;

    #[async_trait]
    impl ExtractionModel for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, CallError> {
            Ok(ModelReply {
                content: request.user.clone(),
                ..Default::default()
            })
        }
    }

    fn request() -> ModelRequest {
        ModelRequest {
            system: "s".into(),
            user: "u".into(),
            temperature: 0.1,
            max_tokens: 16,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_reported_with_limit() {
        let err = call_model(&Slow, &request(), Duration::from_secs(30), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Timeout { secs: 30 });
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let err = call_model(&Slow, &request(), Duration::from_secs(30), &token)
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Cancelled);
    }

    #[tokio::test]
    async fn successful_call_passes_through() {
        let reply = call_model(&Echo, &request(), Duration::from_secs(30), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.content, "u");
    }
}
