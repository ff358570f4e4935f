//! Configuration types for the dossier pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`] or read from `DOSSIER_*` environment
//! variables with [`PipelineConfig::from_env`]. Setters clamp values into
//! their allowed ranges; `build()` rejects combinations that cannot work.
//!
//! Cloud credentials live next to their clients
//! ([`crate::storage::GcsSettings`], [`crate::ocr::DocumentAiSettings`]).

use crate::error::ReportError;
use crate::pipeline::extract::{MAX_WORKERS, MIN_WORKERS};
use crate::pipeline::index::{MAX_WINDOW, MIN_WINDOW};
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Floor and ceilings applied to every operator-supplied model timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub floor_secs: u64,
    /// Ceiling for Pass 1, Pass 2, Pass 4 and the primary Pass 3 attempt.
    pub ceiling_secs: u64,
    /// Ceiling for the Pass 3 fallback attempt.
    pub fallback_ceiling_secs: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            floor_secs: 30,
            ceiling_secs: 240,
            fallback_ceiling_secs: 480,
        }
    }
}

impl TimeoutPolicy {
    /// Clamp a regular model-call timeout.
    pub fn call(&self, secs: u64) -> Duration {
        Duration::from_secs(secs.clamp(self.floor_secs, self.ceiling_secs))
    }

    /// Clamp the consolidation fallback timeout.
    pub fn fallback(&self, secs: u64) -> Duration {
        Duration::from_secs(secs.clamp(self.floor_secs, self.fallback_ceiling_secs))
    }
}

/// Configuration for one dossier job.
///
/// # Example
/// ```rust
/// use dossier_report::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .workers(3)
///     .cluster_window(8)
///     .primary_model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// assert_eq!(config.workers, 3);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Pass 2 worker pool size. Range: 1–4. Default: 2.
    ///
    /// Each worker holds one model call open at a time, so this is also the
    /// maximum number of concurrent extraction calls per job.
    pub workers: usize,

    /// Pages per cluster when the indexer falls back to sequential windows.
    /// Range: 6–12. Default: 10.
    pub cluster_window: usize,

    /// Model used for Pass 1, Pass 2, Pass 4 and the first Pass 3 attempt.
    pub primary_model: String,

    /// Model used for the Pass 3 retry.
    pub fallback_model: String,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, the provider is auto-detected.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for every model call. Default: 0.1.
    pub temperature: f32,

    /// Maximum output tokens for Pass 1, 2 and 4 calls. Default: 4096.
    pub max_tokens: usize,

    /// Maximum output tokens for the consolidated report. Default: 8192.
    pub report_max_tokens: usize,

    /// Clamp policy applied to model-call timeouts.
    pub timeouts: TimeoutPolicy,

    /// Per-call timeout for Pass 1, 2, 4 and the primary Pass 3 attempt. Default: 120.
    pub call_timeout_secs: u64,

    /// Timeout for the Pass 3 fallback attempt. Default: 300.
    pub fallback_timeout_secs: u64,

    /// Time bound for each storage write attempt. Default: 60.
    pub upload_timeout_secs: u64,

    /// Time bound for each cleanup deletion. Default: 10.
    pub cleanup_timeout_secs: u64,

    /// Download timeout for URL sources. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional upload/proxy service used when a URL cannot be fetched directly.
    pub proxy_url: Option<String>,

    /// Capacity of the progress channel. Default: 64.
    pub event_buffer: usize,

    /// Character budget of the OCR text sent to the indexer. Default: 120 000.
    pub index_char_budget: usize,

    /// Character budget of the page text sent per cluster. Default: 60 000.
    pub cluster_char_budget: usize,

    /// Maximum characters per field in a compacted record. Default: 400.
    pub compact_field_chars: usize,

    /// Maximum quotes kept per compacted record. Default: 3.
    pub compact_quotes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            cluster_window: 10,
            primary_model: "gpt-4.1-nano".to_string(),
            fallback_model: "gpt-4.1-mini".to_string(),
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            report_max_tokens: 8192,
            timeouts: TimeoutPolicy::default(),
            call_timeout_secs: 120,
            fallback_timeout_secs: 300,
            upload_timeout_secs: 60,
            cleanup_timeout_secs: 10,
            download_timeout_secs: 120,
            proxy_url: None,
            event_buffer: 64,
            index_char_budget: 120_000,
            cluster_char_budget: 60_000,
            compact_field_chars: 400,
            compact_quotes: 3,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("workers", &self.workers)
            .field("cluster_window", &self.cluster_window)
            .field("primary_model", &self.primary_model)
            .field("fallback_model", &self.fallback_model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("call_timeout_secs", &self.call_timeout_secs)
            .field("fallback_timeout_secs", &self.fallback_timeout_secs)
            .field("timeouts", &self.timeouts)
            .field("proxy_url", &self.proxy_url)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Build a configuration from `DOSSIER_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparseable numbers are an
    /// [`ReportError::InvalidConfig`].
    pub fn from_env() -> Result<Self, ReportError> {
        let mut b = Self::builder();
        if let Some(n) = env_number("DOSSIER_WORKERS")? {
            b = b.workers(n as usize);
        }
        if let Some(n) = env_number("DOSSIER_CLUSTER_WINDOW")? {
            b = b.cluster_window(n as usize);
        }
        if let Some(n) = env_number("DOSSIER_CALL_TIMEOUT_SECS")? {
            b = b.call_timeout_secs(n);
        }
        if let Some(n) = env_number("DOSSIER_FALLBACK_TIMEOUT_SECS")? {
            b = b.fallback_timeout_secs(n);
        }
        if let Some(n) = env_number("DOSSIER_UPLOAD_TIMEOUT_SECS")? {
            b = b.upload_timeout_secs(n);
        }
        if let Some(m) = env_string("DOSSIER_PRIMARY_MODEL") {
            b = b.primary_model(m);
        }
        if let Some(m) = env_string("DOSSIER_FALLBACK_MODEL") {
            b = b.fallback_model(m);
        }
        if let Some(p) = env_string("DOSSIER_LLM_PROVIDER") {
            b = b.provider_name(p);
        }
        if let Some(u) = env_string("DOSSIER_PROXY_URL") {
            b = b.proxy_url(u);
        }
        b.build()
    }

    /// Effective timeout for regular model calls.
    pub fn call_timeout(&self) -> Duration {
        self.timeouts.call(self.call_timeout_secs)
    }

    /// Effective timeout for the consolidation fallback attempt.
    pub fn fallback_timeout(&self) -> Duration {
        self.timeouts.fallback(self.fallback_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_number(key: &str) -> Result<Option<u64>, ReportError> {
    match env_string(key) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ReportError::InvalidConfig(format!("{key} must be a number, got '{v}'"))),
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n.clamp(MIN_WORKERS, MAX_WORKERS);
        self
    }

    pub fn cluster_window(mut self, n: usize) -> Self {
        self.config.cluster_window = n.clamp(MIN_WINDOW, MAX_WINDOW);
        self
    }

    pub fn primary_model(mut self, model: impl Into<String>) -> Self {
        self.config.primary_model = model.into();
        self
    }

    pub fn fallback_model(mut self, model: impl Into<String>) -> Self {
        self.config.fallback_model = model.into();
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn report_max_tokens(mut self, n: usize) -> Self {
        self.config.report_max_tokens = n;
        self
    }

    pub fn timeouts(mut self, policy: TimeoutPolicy) -> Self {
        self.config.timeouts = policy;
        self
    }

    pub fn call_timeout_secs(mut self, secs: u64) -> Self {
        self.config.call_timeout_secs = secs;
        self
    }

    pub fn fallback_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fallback_timeout_secs = secs;
        self
    }

    pub fn upload_timeout_secs(mut self, secs: u64) -> Self {
        self.config.upload_timeout_secs = secs.max(1);
        self
    }

    pub fn cleanup_timeout_secs(mut self, secs: u64) -> Self {
        self.config.cleanup_timeout_secs = secs.max(1);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn proxy_url(mut self, url: impl Into<String>) -> Self {
        self.config.proxy_url = Some(url.into());
        self
    }

    pub fn event_buffer(mut self, n: usize) -> Self {
        self.config.event_buffer = n.max(1);
        self
    }

    pub fn index_char_budget(mut self, n: usize) -> Self {
        self.config.index_char_budget = n;
        self
    }

    pub fn cluster_char_budget(mut self, n: usize) -> Self {
        self.config.cluster_char_budget = n;
        self
    }

    pub fn compact_field_chars(mut self, n: usize) -> Self {
        self.config.compact_field_chars = n.max(16);
        self
    }

    pub fn compact_quotes(mut self, n: usize) -> Self {
        self.config.compact_quotes = n;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ReportError> {
        let c = &self.config;
        let t = &c.timeouts;
        if t.floor_secs == 0 || t.floor_secs > t.ceiling_secs || t.ceiling_secs > t.fallback_ceiling_secs {
            return Err(ReportError::InvalidConfig(format!(
                "timeout policy must satisfy 0 < floor ≤ ceiling ≤ fallback ceiling, got {}/{}/{}",
                t.floor_secs, t.ceiling_secs, t.fallback_ceiling_secs
            )));
        }
        if c.fallback_timeout() <= c.call_timeout() {
            return Err(ReportError::InvalidConfig(format!(
                "fallback timeout ({}s) must be longer than the call timeout ({}s)",
                c.fallback_timeout().as_secs(),
                c.call_timeout().as_secs()
            )));
        }
        if c.primary_model.trim().is_empty() || c.fallback_model.trim().is_empty() {
            return Err(ReportError::InvalidConfig("model names must not be empty".into()));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let c = PipelineConfig::builder().build().unwrap();
        assert_eq!(c.workers, 2);
        assert_eq!(c.cluster_window, 10);
        assert_eq!(c.call_timeout(), Duration::from_secs(120));
        assert_eq!(c.fallback_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn setters_clamp() {
        let c = PipelineConfig::builder()
            .workers(16)
            .cluster_window(3)
            .build()
            .unwrap();
        assert_eq!(c.workers, MAX_WORKERS);
        assert_eq!(c.cluster_window, MIN_WINDOW);

        let c = PipelineConfig::builder()
            .workers(0)
            .cluster_window(40)
            .build()
            .unwrap();
        assert_eq!(c.workers, MIN_WORKERS);
        assert_eq!(c.cluster_window, MAX_WINDOW);
    }

    #[test]
    fn timeout_policy_clamps() {
        let p = TimeoutPolicy::default();
        assert_eq!(p.call(5), Duration::from_secs(30));
        assert_eq!(p.call(1000), Duration::from_secs(240));
        assert_eq!(p.fallback(1000), Duration::from_secs(480));
    }

    #[test]
    fn fallback_must_outlast_primary() {
        let err = PipelineConfig::builder()
            .call_timeout_secs(200)
            .fallback_timeout_secs(100)
            .build()
            .unwrap_err();
        assert!(matches!(err, ReportError::InvalidConfig(_)));
    }

    #[test]
    fn invalid_policy_rejected() {
        let err = PipelineConfig::builder()
            .timeouts(TimeoutPolicy {
                floor_secs: 300,
                ceiling_secs: 240,
                fallback_ceiling_secs: 480,
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("floor"));
    }
}
