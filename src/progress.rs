//! Progress events and the per-job emitter.
//!
//! Pipeline stages push [`ProgressEvent`]s into a bounded channel through a
//! [`ProgressEmitter`]; a single consumer drains the matching [`EventStream`]
//! (see [`crate::stream::write_ndjson`] for the line-delimited framing).
//!
//! The emitter is deliberately not `Clone`. [`ProgressEmitter::finish`]
//! consumes it, sends the terminal event and drops the last sender, so a job
//! cannot emit two terminal events and the stream always closes right after
//! its terminal event.

use crate::job::JobState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// The consumer side of a job's progress channel.
pub type EventStream = ReceiverStream<ProgressEvent>;

/// One message in a job's status stream.
///
/// Serialised untagged so each variant has exactly the wire shape callers
/// expect: `{step,progress,message}`, `{phase,status,…}`, `{log:{…}}`,
/// `{result:{…}}` or `{step:"Error",message,error:true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    Error(ErrorEvent),
    Step(StepEvent),
    Phase(PhaseEvent),
    Log { log: LogEntry },
    Result { result: ResultPayload },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Error(_) | ProgressEvent::Result { .. })
    }
}

/// Coarse stage progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEvent {
    pub step: String,
    /// 0–100.
    pub progress: u8,
    pub message: String,
}

/// Pipeline pass a phase event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pass1,
    Pass2,
    Pass3,
    Pass4,
}

/// Fine-grained pipeline telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub phase: Phase,
    /// e.g. `start`, `done`, `fallback`, `cluster:start`, `cluster:done`, `cluster:fail`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PhaseEvent {
    pub fn new(phase: Phase, status: impl Into<String>) -> Self {
        Self {
            phase,
            status: status.into(),
            cluster: None,
            title: None,
            total: None,
            reason: None,
        }
    }

    pub fn cluster(mut self, index: usize, title: impl Into<String>) -> Self {
        self.cluster = Some(index);
        self.title = Some(title.into());
        self
    }

    pub fn total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Free-form diagnostic trace; consumers may ignore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Terminal success payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub file_name: String,
    pub total_pages: usize,
    /// The rendered report (Markdown).
    pub extracted_data: String,
    pub processing_method: String,
    pub timestamp: DateTime<Utc>,
}

/// Terminal failure: always `{ "step": "Error", "message": …, "error": true }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub step: String,
    pub message: String,
    pub error: bool,
}

impl ErrorEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            step: "Error".to_string(),
            message: message.into(),
            error: true,
        }
    }
}

/// The last event of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Result(ResultPayload),
    Error(String),
}

impl From<Terminal> for ProgressEvent {
    fn from(t: Terminal) -> Self {
        match t {
            Terminal::Result(result) => ProgressEvent::Result { result },
            Terminal::Error(message) => ProgressEvent::Error(ErrorEvent::new(message)),
        }
    }
}

/// Sender side of a job's progress channel.
#[derive(Debug)]
pub struct ProgressEmitter {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressEmitter {
    /// Create an emitter and the single stream that drains it.
    pub fn channel(capacity: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, ReceiverStream::new(rx))
    }

    /// Push an event. A gone consumer is not an error for the pipeline.
    pub async fn emit(&self, event: ProgressEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("progress consumer disconnected; event dropped");
        }
    }

    pub async fn step(&self, step: impl Into<String>, progress: u8, message: impl Into<String>) {
        self.emit(ProgressEvent::Step(StepEvent {
            step: step.into(),
            progress: progress.min(100),
            message: message.into(),
        }))
        .await;
    }

    /// Announce a state transition.
    pub async fn state(&self, state: JobState, progress: u8, message: impl Into<String>) {
        self.step(state.as_str(), progress, message).await;
    }

    pub async fn phase(&self, event: PhaseEvent) {
        self.emit(ProgressEvent::Phase(event)).await;
    }

    /// Emit a `log` event and mirror it into `tracing`.
    pub async fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        let message = message.into();
        match level {
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        self.emit(ProgressEvent::Log {
            log: LogEntry {
                level,
                message,
                timestamp: Utc::now(),
                data,
            },
        })
        .await;
    }

    /// Send the terminal event and close the stream.
    pub async fn finish(self, terminal: Terminal) {
        self.emit(terminal.into()).await;
    }

    /// True once the consumer has dropped its stream.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the consumer drops its stream.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[test]
    fn error_event_wire_shape() {
        let ev: ProgressEvent = Terminal::Error("boom".into()).into();
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"step": "Error", "message": "boom", "error": true})
        );
    }

    #[test]
    fn phase_event_wire_shape() {
        let ev = ProgressEvent::Phase(PhaseEvent::new(Phase::Pass2, "cluster:fail").cluster(2, "B").reason("timeout"));
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"phase": "pass2", "status": "cluster:fail", "cluster": 2, "title": "B", "reason": "timeout"})
        );
    }

    #[test]
    fn result_payload_is_camel_case() {
        let ev: ProgressEvent = Terminal::Result(ResultPayload {
            file_name: "a.pdf".into(),
            total_pages: 8,
            extracted_data: "# R".into(),
            processing_method: "ocr+4pass".into(),
            timestamp: Utc::now(),
        })
        .into();
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["result"]["fileName"], "a.pdf");
        assert_eq!(v["result"]["totalPages"], 8);
        assert!(v["result"]["processingMethod"].is_string());
    }

    #[test]
    fn events_deserialise_into_the_right_variant() {
        let step: ProgressEvent =
            serde_json::from_value(json!({"step": "indexing", "progress": 35, "message": "m"})).unwrap();
        assert!(matches!(step, ProgressEvent::Step(_)));
        let err: ProgressEvent =
            serde_json::from_value(json!({"step": "Error", "message": "m", "error": true})).unwrap();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn finish_closes_stream_after_terminal_event() {
        let (emitter, mut stream) = ProgressEmitter::channel(8);
        emitter.step("uploading", 5, "go").await;
        emitter.finish(Terminal::Error("x".into())).await;

        let first = stream.next().await.unwrap();
        assert!(!first.is_terminal());
        let last = stream.next().await.unwrap();
        assert!(last.is_terminal());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn emit_after_consumer_drop_is_silent() {
        let (emitter, stream) = ProgressEmitter::channel(1);
        drop(stream);
        assert!(emitter.is_closed());
        emitter.log(LogLevel::Info, "nobody listens", None).await;
        emitter.finish(Terminal::Error("x".into())).await;
    }
}
