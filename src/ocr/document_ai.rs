//! Google Document AI batch OCR.
//!
//! `batchProcess` takes a `gs://` input and writes JSON shards under a
//! `gs://` output prefix; the call returns a long-running operation that is
//! polled until `done`. Shards are then read back through the
//! [`ObjectStore`] and parsed with [`super::pages_from_shards`].

use super::{pages_from_shards, OcrEngine, OcrError};
use crate::error::ReportError;
use crate::model::Page;
use crate::storage::gcs::required_env;
use crate::storage::ObjectStore;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Connection settings for [`DocumentAiOcr`].
#[derive(Clone)]
pub struct DocumentAiSettings {
    pub project: String,
    /// Processor region, e.g. `eu` or `us`.
    pub location: String,
    pub processor_id: String,
    pub access_token: String,
    /// Override for tests. Default: `https://{location}-documentai.googleapis.com`.
    pub api_base: Option<String>,
    /// Delay between operation polls. Default: 5s.
    pub poll_interval: Duration,
    /// Give up on the operation after this long. Default: 15 min.
    pub deadline: Duration,
}

impl std::fmt::Debug for DocumentAiSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentAiSettings")
            .field("project", &self.project)
            .field("location", &self.location)
            .field("processor_id", &self.processor_id)
            .field("access_token", &"<redacted>")
            .field("poll_interval", &self.poll_interval)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl DocumentAiSettings {
    /// Read `DOSSIER_DOCAI_PROJECT`, `DOSSIER_DOCAI_LOCATION`,
    /// `DOSSIER_DOCAI_PROCESSOR` and `DOSSIER_GCP_ACCESS_TOKEN`.
    pub fn from_env() -> Result<Self, ReportError> {
        Ok(Self {
            project: required_env("DOSSIER_DOCAI_PROJECT")?,
            location: std::env::var("DOSSIER_DOCAI_LOCATION")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "eu".to_string()),
            processor_id: required_env("DOSSIER_DOCAI_PROCESSOR")?,
            access_token: required_env("DOSSIER_GCP_ACCESS_TOKEN")?,
            api_base: std::env::var("DOSSIER_DOCAI_API_BASE").ok().filter(|v| !v.is_empty()),
            poll_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(900),
        })
    }

    fn base(&self) -> String {
        self.api_base
            .clone()
            .unwrap_or_else(|| format!("https://{}-documentai.googleapis.com", self.location))
    }

    fn processor_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/processors/{}",
            self.project, self.location, self.processor_id
        )
    }
}

/// [`OcrEngine`] backed by a Document AI OCR processor.
pub struct DocumentAiOcr {
    settings: DocumentAiSettings,
    store: Arc<dyn ObjectStore>,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<OperationError>,
    #[serde(default)]
    metadata: Option<OperationMetadata>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationMetadata {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    state_message: Option<String>,
}

impl DocumentAiOcr {
    pub fn new(settings: DocumentAiSettings, store: Arc<dyn ObjectStore>) -> Result<Self, ReportError> {
        if settings.project.is_empty() || settings.processor_id.is_empty() {
            return Err(ReportError::Configuration(
                "Document AI project and processor id are required".into(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ReportError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            settings,
            store,
            client,
        })
    }

    async fn submit(&self, input_uri: &str, output_uri: &str) -> Result<Operation, OcrError> {
        let url = format!(
            "{}/v1/{}:batchProcess",
            self.settings.base(),
            self.settings.processor_path()
        );
        let body = json!({
            "inputDocuments": {
                "gcsDocuments": {
                    "documents": [{ "gcsUri": input_uri, "mimeType": "application/pdf" }]
                }
            },
            "documentOutputConfig": {
                "gcsOutputConfig": { "gcsUri": output_uri }
            }
        });
        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.settings.access_token))
            .json(&body)
            .send()
            .await
            .map_err(|e| OcrError::Submit(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(OcrError::Submit(format!("HTTP {status}: {}", truncate(&text))));
        }
        response
            .json::<Operation>()
            .await
            .map_err(|e| OcrError::Submit(e.to_string()))
    }

    async fn poll(&self, name: &str) -> Result<Operation, OcrError> {
        let url = format!("{}/v1/{}", self.settings.base(), name);
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.settings.access_token))
            .send()
            .await
            .map_err(|e| OcrError::Failed(format!("polling {name}: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(OcrError::Failed(format!("polling {name}: HTTP {status}: {}", truncate(&text))));
        }
        response
            .json::<Operation>()
            .await
            .map_err(|e| OcrError::Failed(e.to_string()))
    }

    async fn wait(&self, mut op: Operation) -> Result<(), OcrError> {
        let started = Instant::now();
        while !op.done {
            if started.elapsed() >= self.settings.deadline {
                return Err(OcrError::Deadline {
                    secs: self.settings.deadline.as_secs(),
                });
            }
            tokio::time::sleep(self.settings.poll_interval).await;
            op = self.poll(&op.name).await?;
            debug!(
                "OCR operation {}: {}",
                op.name,
                op.metadata
                    .as_ref()
                    .and_then(|m| m.state.as_deref())
                    .unwrap_or("RUNNING")
            );
        }
        operation_outcome(&op)
    }
}

/// A finished operation succeeded unless it carries an error or a failed state.
fn operation_outcome(op: &Operation) -> Result<(), OcrError> {
    if let Some(err) = &op.error {
        return Err(OcrError::Failed(format!("code {}: {}", err.code, err.message)));
    }
    let state = op.metadata.as_ref().and_then(|m| m.state.as_deref());
    match state {
        Some("FAILED") | Some("CANCELLED") => {
            let msg = op
                .metadata
                .as_ref()
                .and_then(|m| m.state_message.clone())
                .unwrap_or_default();
            Err(OcrError::Failed(format!("{}: {}", state.unwrap_or_default(), msg)))
        }
        _ => Ok(()),
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(300).collect()
}

#[async_trait]
impl OcrEngine for DocumentAiOcr {
    async fn run_ocr(&self, input_uri: &str, output_prefix: &str) -> Result<Vec<Page>, OcrError> {
        let output_uri = self.store.uri(output_prefix);
        info!("Submitting OCR: {} → {}", input_uri, output_uri);
        let op = self.submit(input_uri, &output_uri).await?;
        self.wait(op).await?;

        let keys: Vec<String> = self
            .store
            .list(output_prefix)
            .await
            .map_err(|e| OcrError::Output(e.to_string()))?
            .into_iter()
            .filter(|k| k.ends_with(".json"))
            .collect();
        if keys.is_empty() {
            return Err(OcrError::Output(format!("no output shards under {output_prefix}")));
        }
        let mut shards = Vec::with_capacity(keys.len());
        for key in &keys {
            shards.push(
                self.store
                    .get(key)
                    .await
                    .map_err(|e| OcrError::Output(e.to_string()))?,
            );
        }
        let pages = pages_from_shards(&shards)?;
        info!("OCR finished: {} shards, {} pages", keys.len(), pages.len());
        Ok(pages)
    }
}
