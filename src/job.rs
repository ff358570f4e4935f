//! Job identity, lifecycle and the per-job cleanup ledger.
//!
//! A [`Job`] moves strictly forward through [`JobState`]; the runner emits a
//! progress event on every transition. [`JobContext`] records each storage
//! key before its first write attempt, so Cleanup can be handed every key
//! that may exist, wherever the job stopped.

use crate::error::ReportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique job identifier; also the storage namespace of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the source dossier comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceRef {
    /// HTTP/HTTPS URL; downloaded, then uploaded into the job namespace.
    Url(String),
    /// `gs://bucket/key` already in storage; handed to OCR as-is and never deleted.
    StorageUri(String),
    /// Local file (CLI use); read, then uploaded into the job namespace.
    LocalPath(std::path::PathBuf),
}

impl SourceRef {
    /// Classify a user-supplied string.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.starts_with("http://") || input.starts_with("https://") {
            SourceRef::Url(input.to_string())
        } else if input.starts_with("gs://") {
            SourceRef::StorageUri(input.to_string())
        } else {
            SourceRef::LocalPath(input.into())
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Url(s) | SourceRef::StorageUri(s) => f.write_str(s),
            SourceRef::LocalPath(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Entry-point request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub source: SourceRef,
    pub file_name: String,
}

impl JobRequest {
    pub fn new(source: SourceRef, file_name: impl Into<String>) -> Self {
        Self {
            source,
            file_name: file_name.into(),
        }
    }
}

/// Lifecycle of a job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Created,
    Uploading,
    OcrRunning,
    Indexing,
    Extracting,
    Consolidating,
    Validating,
    CleaningUp,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    /// Forward-only: any later non-terminal state, and the terminal states
    /// only from `CleaningUp`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        if self.is_terminal() || next <= self {
            return false;
        }
        if next.is_terminal() {
            return self == JobState::CleaningUp;
        }
        true
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Uploading => "uploading",
            JobState::OcrRunning => "ocr-running",
            JobState::Indexing => "indexing",
            JobState::Extracting => "extracting",
            JobState::Consolidating => "consolidating",
            JobState::Validating => "validating",
            JobState::CleaningUp => "cleaning-up",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running job.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub request: JobRequest,
    state: JobState,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        Self {
            id: JobId::new(),
            request,
            state: JobState::Created,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn advance(&mut self, next: JobState) -> Result<(), ReportError> {
        if !self.state.can_transition_to(next) {
            return Err(ReportError::Internal(format!(
                "illegal job transition {} → {}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// Storage keys owned by one job, all under `jobs/{id}/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobKeys {
    root: String,
}

impl JobKeys {
    pub fn new(id: JobId) -> Self {
        Self {
            root: format!("jobs/{id}/"),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn probe(&self) -> String {
        format!("{}probe.txt", self.root)
    }

    pub fn input(&self, file_name: &str) -> String {
        format!("{}input/{}", self.root, sanitize_file_name(file_name))
    }

    pub fn ocr_output_prefix(&self) -> String {
        format!("{}ocr/", self.root)
    }
}

/// Keep `[A-Za-z0-9._-]`, replace everything else, never return an empty name.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "document.pdf".to_string()
    } else {
        cleaned
    }
}

/// Something Cleanup must delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupTarget {
    Object(String),
    Prefix(String),
}

/// Write-once ledger of what this job created in storage.
///
/// Each slot is filled at most once, just before the first write to that
/// key or, for the OCR prefix, once output is known to exist; later writes
/// to a filled slot are ignored. Cleanup only ever reads it.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub keys: JobKeys,
    probe: Option<String>,
    input: Option<String>,
    ocr_output: Option<String>,
}

impl JobContext {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            keys: JobKeys::new(job_id),
            probe: None,
            input: None,
            ocr_output: None,
        }
    }

    pub fn record_probe(&mut self, key: impl Into<String>) {
        self.probe.get_or_insert_with(|| key.into());
    }

    pub fn record_input(&mut self, key: impl Into<String>) {
        self.input.get_or_insert_with(|| key.into());
    }

    pub fn record_ocr_output(&mut self, prefix: impl Into<String>) {
        self.ocr_output.get_or_insert_with(|| prefix.into());
    }

    pub fn input_key(&self) -> Option<&str> {
        self.input.as_deref()
    }

    /// Everything that exists, in deletion order.
    pub fn cleanup_targets(&self) -> Vec<CleanupTarget> {
        let mut targets = Vec::new();
        if let Some(k) = &self.input {
            targets.push(CleanupTarget::Object(k.clone()));
        }
        if let Some(k) = &self.probe {
            targets.push(CleanupTarget::Object(k.clone()));
        }
        if let Some(p) = &self.ocr_output {
            targets.push(CleanupTarget::Prefix(p.clone()));
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_ref_parse() {
        assert_eq!(
            SourceRef::parse("https://x.test/a.pdf"),
            SourceRef::Url("https://x.test/a.pdf".into())
        );
        assert_eq!(
            SourceRef::parse("gs://bucket/a.pdf"),
            SourceRef::StorageUri("gs://bucket/a.pdf".into())
        );
        assert!(matches!(SourceRef::parse("./a.pdf"), SourceRef::LocalPath(_)));
    }

    #[test]
    fn transitions_are_forward_only() {
        use JobState::*;
        assert!(Created.can_transition_to(Uploading));
        assert!(Created.can_transition_to(OcrRunning));
        assert!(Indexing.can_transition_to(CleaningUp));
        assert!(CleaningUp.can_transition_to(Done));
        assert!(CleaningUp.can_transition_to(Failed));
        assert!(!Extracting.can_transition_to(Indexing));
        assert!(!Extracting.can_transition_to(Extracting));
        assert!(!Validating.can_transition_to(Done));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Done));
    }

    #[test]
    fn job_rejects_backwards_move() {
        let mut job = Job::new(JobRequest::new(SourceRef::parse("a.pdf"), "a.pdf"));
        job.advance(JobState::Indexing).unwrap();
        assert!(job.advance(JobState::Uploading).is_err());
        assert_eq!(job.state(), JobState::Indexing);
    }

    #[test]
    fn keys_are_namespaced() {
        let id = JobId::new();
        let keys = JobKeys::new(id);
        assert!(keys.input("dossier 1.pdf").starts_with(&format!("jobs/{id}/input/")));
        assert!(keys.input("dossier 1.pdf").ends_with("dossier_1.pdf"));
        assert!(keys.ocr_output_prefix().ends_with("/ocr/"));
    }

    #[test]
    fn sanitize_strips_paths() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name(""), "document.pdf");
        assert_eq!(sanitize_file_name("Akte Müller.pdf"), "Akte_M_ller.pdf");
    }

    #[test]
    fn context_only_lists_created_keys() {
        let mut ctx = JobContext::new(JobId::new());
        assert!(ctx.cleanup_targets().is_empty());

        ctx.record_input("jobs/x/input/a.pdf");
        ctx.record_input("jobs/x/input/other.pdf");
        assert_eq!(
            ctx.cleanup_targets(),
            vec![CleanupTarget::Object("jobs/x/input/a.pdf".into())]
        );
    }
}
