//! In-memory fakes for the pipeline's external services.
//!
//! No network, no credentials: the object store is a map, OCR returns
//! synthetic pages, and models answer from a per-test script keyed on the
//! pass that sent the request.

#![allow(dead_code)]

use async_trait::async_trait;
use dossier_report::ocr::OcrError;
use dossier_report::progress::ProgressEvent;
use dossier_report::prompts::{
    consolidation_system_prompt, extraction_system_prompt, validation_system_prompt,
    INDEX_SYSTEM_PROMPT, NO_ADDENDUM_MARKER,
};
use dossier_report::{
    spawn_job, CallError, Collaborators, ExtractionModel, JobOutcome, JobRequest, ModelReply,
    ModelRequest, ModelSet, ObjectStore, OcrEngine, Page, PipelineConfig, ReportError, StoreError,
};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ── Object store ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    pub fail_direct: AtomicBool,
    pub fail_signed: AtomicBool,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    /// `(key, "direct" | "signed")` for every successful write.
    writes: Mutex<Vec<(String, &'static str)>>,
    deletes: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_direct() -> Arc<Self> {
        let store = Self::default();
        store.fail_direct.store(true, Ordering::SeqCst);
        Arc::new(store)
    }

    pub fn failing_both() -> Arc<Self> {
        let store = Self::default();
        store.fail_direct.store(true, Ordering::SeqCst);
        store.fail_signed.store(true, Ordering::SeqCst);
        Arc::new(store)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn writes(&self) -> Vec<(String, &'static str)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    fn insert(&self, key: &str, bytes: &[u8], path: &'static str) {
        self.objects.lock().unwrap().insert(key.to_string(), bytes.to_vec());
        self.writes.lock().unwrap().push((key.to_string(), path));
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        "test-bucket"
    }

    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<(), StoreError> {
        if self.fail_direct.load(Ordering::SeqCst) {
            return Err(StoreError::Status {
                status: 403,
                body: "direct writes denied".into(),
            });
        }
        self.insert(key, bytes, "direct");
        Ok(())
    }

    async fn put_signed(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<(), StoreError> {
        if self.fail_signed.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("signed URL rejected".into()));
        }
        self.insert(key, bytes, "signed");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.deletes.lock().unwrap().push(key.to_string());
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

// ── OCR ──────────────────────────────────────────────────────────────────────

/// Returns `pages` synthetic pages and writes one output shard, like the real
/// batch service does.
pub struct FakeOcr {
    pub pages: usize,
    pub store: Arc<MemoryStore>,
    pub fail: bool,
    pub inputs: Mutex<Vec<String>>,
}

impl FakeOcr {
    pub fn new(pages: usize, store: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            pages,
            store,
            fail: false,
            inputs: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl OcrEngine for FakeOcr {
    async fn run_ocr(&self, input_uri: &str, output_prefix: &str) -> Result<Vec<Page>, OcrError> {
        self.inputs.lock().unwrap().push(input_uri.to_string());
        if self.fail {
            return Err(OcrError::Failed("processor unavailable".into()));
        }
        if self.pages > 0 {
            self.store
                .put(&format!("{output_prefix}0/output-0.json"), b"{}", "application/json")
                .await
                .map_err(|e| OcrError::Output(e.to_string()))?;
        }
        Ok((1..=self.pages)
            .map(|number| Page {
                number,
                text: format!("Scanned text of page {number}."),
            })
            .collect())
    }
}

// ── Models ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Index,
    Extract,
    Consolidate,
    Validate,
}

impl Pass {
    pub fn of(request: &ModelRequest) -> Pass {
        if request.system == INDEX_SYSTEM_PROMPT {
            Pass::Index
        } else if request.system == extraction_system_prompt() {
            Pass::Extract
        } else if request.system == consolidation_system_prompt() {
            Pass::Consolidate
        } else if request.system == validation_system_prompt() {
            Pass::Validate
        } else {
            panic!("unknown system prompt: {}", request.system)
        }
    }
}

/// What a scripted model does for one request.
pub enum Reply {
    Text(String),
    Fail(CallError),
    /// Never answers in practice; only the caller's timeout ends it.
    Hang,
}

impl Reply {
    pub fn text(s: impl Into<String>) -> Self {
        Reply::Text(s.into())
    }

    pub fn provider_error(msg: &str) -> Self {
        Reply::Fail(CallError::Provider(msg.to_string()))
    }
}

type Script = Box<dyn Fn(Pass, &ModelRequest) -> Reply + Send + Sync>;

pub struct ScriptedModel {
    name: String,
    script: Script,
    calls: Mutex<Vec<(Pass, ModelRequest)>>,
}

impl ScriptedModel {
    pub fn new(
        name: &str,
        script: impl Fn(Pass, &ModelRequest) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// A model that answers every pass successfully.
    pub fn happy(name: &str) -> Arc<Self> {
        Self::new(name, happy_reply)
    }

    pub fn calls(&self) -> Vec<(Pass, ModelRequest)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, pass: Pass) -> Vec<ModelRequest> {
        self.calls()
            .into_iter()
            .filter(|(p, _)| *p == pass)
            .map(|(_, r)| r)
            .collect()
    }
}

#[async_trait]
impl ExtractionModel for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, CallError> {
        let pass = Pass::of(request);
        self.calls.lock().unwrap().push((pass, request.clone()));
        match (self.script)(pass, request) {
            Reply::Text(content) => Ok(ModelReply {
                content,
                input_tokens: request.user.len() / 4,
                output_tokens: 100,
            }),
            Reply::Fail(e) => Err(e),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Err(CallError::Provider("hang ended".into()))
            }
        }
    }
}

/// Cluster title sent in an extraction request.
pub fn incident_title(request: &ModelRequest) -> String {
    request
        .user
        .lines()
        .find_map(|l| l.strip_prefix("Incident: "))
        .unwrap_or("unknown")
        .to_string()
}

/// Two clusters covering 1-4 and 5-8.
pub const TWO_CLUSTERS: &str = r#"[
  {"title": "Speeding on the A7", "pages": [1, 2, 3, 4], "reason": "radar measurement"},
  {"title": "Parking violation", "pages": [5, 6, 7, 8], "reason": "municipal notice"}
]"#;

pub fn happy_reply(pass: Pass, request: &ModelRequest) -> Reply {
    match pass {
        Pass::Index => Reply::text(TWO_CLUSTERS),
        Pass::Extract => Reply::text(format!(
            r#"{{"title": "{}", "source_pages": [], "what": "fined", "points": "1",
                "quotes": [{{"page": 1, "text": "The measured speed was 92 km/h."}}]}}"#,
            incident_title(request)
        )),
        Pass::Consolidate => Reply::text(
            "```markdown\n# Dossier report\n\nThe driver was fined (page 1).\n```",
        ),
        Pass::Validate => Reply::text(NO_ADDENDUM_MARKER),
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub ocr: Arc<FakeOcr>,
    pub primary: Arc<ScriptedModel>,
    pub fallback: Arc<ScriptedModel>,
    pub config: PipelineConfig,
}

impl Harness {
    pub fn new(pages: usize, primary: Arc<ScriptedModel>, fallback: Arc<ScriptedModel>) -> Self {
        let store = MemoryStore::new();
        Self::with_store(store, pages, primary, fallback)
    }

    pub fn with_store(
        store: Arc<MemoryStore>,
        pages: usize,
        primary: Arc<ScriptedModel>,
        fallback: Arc<ScriptedModel>,
    ) -> Self {
        Self {
            ocr: FakeOcr::new(pages, Arc::clone(&store)),
            store,
            primary,
            fallback,
            config: PipelineConfig::default(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        let store: Arc<dyn ObjectStore> = self.store.clone();
        let ocr: Arc<dyn OcrEngine> = self.ocr.clone();
        let primary: Arc<dyn ExtractionModel> = self.primary.clone();
        let fallback: Arc<dyn ExtractionModel> = self.fallback.clone();
        Collaborators::new(store, ocr, ModelSet::new(primary, fallback))
    }

    /// Run a job to completion, collecting every event.
    pub async fn run(
        &self,
        request: JobRequest,
    ) -> (Vec<ProgressEvent>, Result<JobOutcome, ReportError>) {
        self.run_with(request, self.collaborators(), CancellationToken::new())
            .await
    }

    pub async fn run_with(
        &self,
        request: JobRequest,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> (Vec<ProgressEvent>, Result<JobOutcome, ReportError>) {
        let (events, handle) = spawn_job(request, Arc::new(self.config.clone()), collaborators, cancel);
        let events: Vec<ProgressEvent> = events.collect().await;
        let result = handle.await.expect("job task panicked");
        (events, result)
    }
}

/// A `%PDF` file on disk for local-path requests.
pub fn pdf_file() -> tempfile::NamedTempFile {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(b"%PDF-1.4\n% scanned dossier\n").expect("write pdf");
    file
}
