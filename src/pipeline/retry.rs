//! Ordered attempt strategies.
//!
//! A retry policy is data: a list of [`AttemptStrategy`] values tried in
//! order by [`try_with_fallbacks`]. The first success wins; when every
//! attempt fails the *last* error is returned, since it comes from the most
//! lenient configuration and best describes why the stage gave up.

use super::llm::ExtractionModel;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// What an attempt sends to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Inputs as produced by the previous stage.
    Full,
    /// Inputs with long fields truncated and quotes thinned.
    Compacted,
}

/// One way of performing a stage.
#[derive(Clone)]
pub struct AttemptStrategy {
    /// Reported as `processingMethod` when this attempt wins.
    pub label: String,
    pub model: Arc<dyn ExtractionModel>,
    pub timeout: Duration,
    pub payload: Payload,
}

impl fmt::Debug for AttemptStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptStrategy")
            .field("label", &self.label)
            .field("model", &self.model.name())
            .field("timeout", &self.timeout)
            .field("payload", &self.payload)
            .finish()
    }
}

/// The winning attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub label: String,
    /// 1-based position of the winning strategy.
    pub attempt: usize,
}

/// Every strategy failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted<E> {
    pub attempts: usize,
    /// `None` only when no strategies were given.
    pub last_error: Option<E>,
}

/// Try each strategy in order until one succeeds.
pub async fn try_with_fallbacks<T, E, F, Fut>(
    strategies: &[AttemptStrategy],
    mut attempt: F,
) -> Result<Attempted<T>, Exhausted<E>>
where
    F: FnMut(&AttemptStrategy) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut last_error = None;
    for (i, strategy) in strategies.iter().enumerate() {
        match attempt(strategy).await {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    label: strategy.label.clone(),
                    attempt: i + 1,
                })
            }
            Err(e) => {
                warn!("Attempt {} ({}) failed: {}", i + 1, strategy.label, e);
                last_error = Some(e);
            }
        }
    }
    Err(Exhausted {
        attempts: strategies.len(),
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use crate::pipeline::llm::{ModelReply, ModelRequest};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Named(&'static str);

    #[async_trait]
    impl ExtractionModel for Named {
        fn name(&self) -> &str {
            self.0
        }
        async fn complete(&self, _r: &ModelRequest) -> Result<ModelReply, CallError> {
            Ok(ModelReply::default())
        }
    }

    fn strategies() -> Vec<AttemptStrategy> {
        vec![
            AttemptStrategy {
                label: "primary".into(),
                model: Arc::new(Named("a")),
                timeout: Duration::from_secs(30),
                payload: Payload::Full,
            },
            AttemptStrategy {
                label: "fallback".into(),
                model: Arc::new(Named("b")),
                timeout: Duration::from_secs(60),
                payload: Payload::Compacted,
            },
        ]
    }

    #[tokio::test]
    async fn first_success_wins() {
        let seen = Mutex::new(Vec::new());
        let result = try_with_fallbacks(&strategies(), |s| {
            seen.lock().unwrap().push(s.label.clone());
            async { Ok::<_, String>(42) }
        })
        .await
        .unwrap();
        assert_eq!(result.value, 42);
        assert_eq!(result.attempt, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["primary"]);
    }

    #[tokio::test]
    async fn falls_through_to_second() {
        let result = try_with_fallbacks(&strategies(), |s| {
            let payload = s.payload;
            async move {
                match payload {
                    Payload::Full => Err("too big".to_string()),
                    Payload::Compacted => Ok("ok"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result.label, "fallback");
        assert_eq!(result.attempt, 2);
    }

    #[tokio::test]
    async fn exhausted_reports_last_error() {
        let err = try_with_fallbacks(&strategies(), |s| {
            let label = s.label.clone();
            async move { Err::<(), _>(format!("{label} failed")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(err.last_error.as_deref(), Some("fallback failed"));
    }

    #[tokio::test]
    async fn no_strategies_is_exhausted() {
        let err = try_with_fallbacks(&[], |_| async { Ok::<u8, String>(1) })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 0);
        assert!(err.last_error.is_none());
    }
}
