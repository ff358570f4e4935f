//! Error types for the dossier-report library.
//!
//! Three distinct error types reflect three distinct failure modes:
//!
//! * [`ReportError`] (**fatal**): the job cannot produce a report (missing
//!   credentials, upload rejected on both paths, OCR failure, zero pages,
//!   consolidation failed twice). Returned from the top-level runner and
//!   converted into the terminal `error` event.
//!
//! * [`CallError`]: a single model call failed (timeout, provider error,
//!   unparseable output). Stages decide whether it is fatal: Pass 1 falls
//!   back, Pass 2 records it, Pass 3 retries, Pass 4 skips.
//!
//! * [`ClusterFailure`] (**non-fatal**): one cluster of pages could not be
//!   extracted. Stored alongside the successful records so callers can see
//!   partial success instead of losing the whole dossier to one bad cluster.

use thiserror::Error;

/// All fatal errors a job can terminate with.
#[derive(Debug, Error)]
pub enum ReportError {
    // ── Setup errors ──────────────────────────────────────────────────────
    /// Missing credentials, bucket names or processor ids.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Input errors ──────────────────────────────────────────────────────
    /// Empty source, non-PDF bytes, or an OCR result with zero pages.
    #[error("Boundary error: {0}")]
    Boundary(String),

    /// The source document could not be fetched, directly or via the proxy.
    #[error("Failed to download '{url}': {reason}")]
    Download { url: String, reason: String },

    /// Both the direct and the signed-URL write were rejected.
    #[error("Upload of '{key}' failed on both paths (direct: {direct}; signed URL: {signed})\nCheck bucket permissions and credentials.")]
    Upload {
        key: String,
        direct: String,
        signed: String,
    },

    // ── Upstream errors ───────────────────────────────────────────────────
    /// The OCR provider rejected the job or the job failed.
    #[error("OCR failed: {0}")]
    Ocr(String),

    /// Pass 3 failed on every attempt; carries the last attempt's error.
    #[error("Consolidation failed after {attempts} attempts: {last_error}")]
    Consolidation { attempts: usize, last_error: String },

    /// The caller went away and the cancellation token fired.
    #[error("Job cancelled during {stage}")]
    Cancelled { stage: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failed model call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// The call did not finish inside its time bound.
    #[error("model call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The provider returned an error (network, 5xx, auth, content filter).
    #[error("provider error: {0}")]
    Provider(String),

    /// The call succeeded but the output did not match the stage schema.
    #[error("unparseable model output: {0}")]
    Parse(String),

    /// The cancellation token fired while the call was in flight.
    #[error("model call cancelled")]
    Cancelled,
}

/// A non-fatal Pass 2 failure for a single cluster.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClusterFailure {
    /// 1-indexed position in the candidate list.
    pub index: usize,
    pub title: String,
    pub error: String,
}

impl std::fmt::Display for ClusterFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cluster {} ('{}'): {}", self.index, self.title, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_display_names_both_paths() {
        let e = ReportError::Upload {
            key: "jobs/1/input/a.pdf".into(),
            direct: "403".into(),
            signed: "timeout".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("direct: 403"), "got: {msg}");
        assert!(msg.contains("signed URL: timeout"), "got: {msg}");
    }

    #[test]
    fn consolidation_display_carries_last_error() {
        let e = ReportError::Consolidation {
            attempts: 2,
            last_error: "second".into(),
        };
        assert!(e.to_string().contains("2 attempts"));
        assert!(e.to_string().ends_with("second"));
    }

    #[test]
    fn call_timeout_display() {
        let e = CallError::Timeout { secs: 90 };
        assert!(e.to_string().contains("90s"));
    }

    #[test]
    fn cluster_failure_display() {
        let f = ClusterFailure {
            index: 2,
            title: "Speeding".into(),
            error: "timed out".into(),
        };
        assert_eq!(f.to_string(), "Cluster 2 ('Speeding'): timed out");
    }
}
