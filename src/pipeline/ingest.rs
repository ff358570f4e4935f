//! Ingest: get the source document into the job's storage namespace.
//!
//! ## Why probe first?
//!
//! A bucket with broken credentials fails the same way for a 5-byte object
//! as for a 50 MB dossier. Writing a tiny probe object first surfaces
//! permission problems before the slow upload, and exercises the same
//! direct → signed-URL fallback the real upload uses.
//!
//! Each key is recorded in the [`JobContext`] before its first write
//! attempt. A write can land after its time bound fires, or be cut off by
//! cancellation, so "attempted" is the only safe point to record it;
//! Cleanup treats a missing object as already deleted.

use crate::config::PipelineConfig;
use crate::error::ReportError;
use crate::job::{JobContext, JobRequest, SourceRef};
use crate::storage::{probe_bucket, upload_with_fallback, ObjectStore, UploadPath};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where the document ended up and how it got there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    /// `gs://` URI handed to the OCR engine.
    pub input_uri: String,
    /// `None` when the request already referenced a stored object.
    pub upload_path: Option<UploadPath>,
    pub bytes: usize,
}

/// Check that `bytes` look like a PDF.
pub fn validate_pdf(bytes: &[u8], origin: &str) -> Result<(), ReportError> {
    if bytes.is_empty() {
        return Err(ReportError::Boundary(format!("source '{origin}' is empty")));
    }
    if !bytes.starts_with(b"%PDF") {
        let magic: Vec<u8> = bytes.iter().take(4).copied().collect();
        return Err(ReportError::Boundary(format!(
            "source '{origin}' is not a PDF (starts with {:?})",
            String::from_utf8_lossy(&magic)
        )));
    }
    Ok(())
}

/// Fetch a remote or local source and validate it.
///
/// `StorageUri` sources are never fetched; callers pass them straight to OCR.
pub async fn fetch_source(source: &SourceRef, config: &PipelineConfig) -> Result<Vec<u8>, ReportError> {
    let bytes = match source {
        SourceRef::Url(url) => download(url, config).await?,
        SourceRef::LocalPath(path) => read_local(path).await?,
        SourceRef::StorageUri(uri) => {
            return Err(ReportError::Internal(format!(
                "'{uri}' is already stored and cannot be fetched"
            )))
        }
    };
    validate_pdf(&bytes, &source.to_string())?;
    Ok(bytes)
}

async fn read_local(path: &Path) -> Result<Vec<u8>, ReportError> {
    tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ReportError::Boundary(format!("file not found: {}", path.display()))
        } else {
            ReportError::Download {
                url: path.display().to_string(),
                reason: e.to_string(),
            }
        }
    })
}

/// Download directly, then once through the configured proxy.
async fn download(url: &str, config: &PipelineConfig) -> Result<Vec<u8>, ReportError> {
    let timeout = Duration::from_secs(config.download_timeout_secs);
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ReportError::Configuration(format!("HTTP client: {e}")))?;

    info!("Downloading source: {}", url);
    let direct = match get_bytes(&client, url, timeout).await {
        Ok(bytes) => return Ok(bytes),
        Err(reason) => reason,
    };

    let Some(proxy) = config.proxy_url.as_deref() else {
        return Err(ReportError::Download {
            url: url.to_string(),
            reason: direct,
        });
    };
    warn!("Direct download failed ({}); retrying via proxy", direct);
    let proxied = proxy_request_url(proxy, url)?;
    get_bytes(&client, &proxied, timeout)
        .await
        .map_err(|proxy_err| ReportError::Download {
            url: url.to_string(),
            reason: format!("direct: {direct}; proxy: {proxy_err}"),
        })
}

/// `{proxy}?url=<encoded source>`.
pub(crate) fn proxy_request_url(proxy: &str, source: &str) -> Result<String, ReportError> {
    reqwest::Url::parse_with_params(proxy, &[("url", source)])
        .map(String::from)
        .map_err(|e| ReportError::Configuration(format!("invalid proxy URL '{proxy}': {e}")))
}

async fn get_bytes(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<Vec<u8>, String> {
    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            format!("timed out after {}s", timeout.as_secs())
        } else {
            e.to_string()
        }
    })?;
    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    debug!("Fetched {} bytes from {}", bytes.len(), url);
    Ok(bytes.to_vec())
}

/// Resolve the request to a stored object, uploading when necessary.
pub async fn ingest(
    request: &JobRequest,
    ctx: &mut JobContext,
    store: &dyn ObjectStore,
    config: &PipelineConfig,
) -> Result<Ingested, ReportError> {
    if let SourceRef::StorageUri(uri) = &request.source {
        info!("Using stored document {}", uri);
        return Ok(Ingested {
            input_uri: uri.clone(),
            upload_path: None,
            bytes: 0,
        });
    }

    let bytes = fetch_source(&request.source, config).await?;
    let limit = config.upload_timeout();

    let probe_key = ctx.keys.probe();
    ctx.record_probe(probe_key.clone());
    let probe_path = probe_bucket(store, &probe_key, limit).await?;
    debug!("Bucket probe succeeded via {}", probe_path.as_str());

    let key = ctx.keys.input(&request.file_name);
    ctx.record_input(key.clone());
    let path = upload_with_fallback(store, &key, &bytes, "application/pdf", limit).await?;
    info!("Uploaded {} bytes to {} ({})", bytes.len(), key, path.as_str());

    Ok(Ingested {
        input_uri: store.uri(&key),
        upload_path: Some(path),
        bytes: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CleanupTarget, JobId};
    use crate::storage::StoreError;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn rejects_empty_and_non_pdf() {
        assert!(matches!(validate_pdf(b"", "a"), Err(ReportError::Boundary(_))));
        assert!(matches!(
            validate_pdf(b"<html>", "a"),
            Err(ReportError::Boundary(_))
        ));
        assert!(validate_pdf(b"%PDF-1.7\n", "a").is_ok());
    }

    #[test]
    fn proxy_url_encodes_source() {
        let url = proxy_request_url("https://proxy.test/fetch", "https://x.test/a b.pdf?x=1").unwrap();
        assert!(url.starts_with("https://proxy.test/fetch?url="));
        assert!(!url.contains("a b"));
        assert!(url.contains("x%3D1"));
    }

    #[tokio::test]
    async fn reads_local_pdf() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"%PDF-1.4 body").unwrap();
        let source = SourceRef::LocalPath(file.path().to_path_buf());
        let bytes = assert_ok!(fetch_source(&source, &PipelineConfig::default()).await);
        assert_eq!(bytes, b"%PDF-1.4 body");
    }

    /// Direct writes land but never return; signed writes are refused.
    #[derive(Default)]
    struct SlowAckStore {
        objects: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ObjectStore for SlowAckStore {
        fn bucket(&self) -> &str {
            "b"
        }
        async fn put(&self, key: &str, _: &[u8], _: &str) -> Result<(), StoreError> {
            self.objects.lock().unwrap().push(key.to_string());
            if key.contains("/input/") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(())
        }
        async fn put_signed(&self, _: &str, _: &[u8], _: &str) -> Result<(), StoreError> {
            Err(StoreError::Status {
                status: 403,
                body: "denied".into(),
            })
        }
        async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
            Err(StoreError::NotFound(key.to_string()))
        }
        async fn list(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn input_written_after_its_time_bound_is_still_cleaned() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"%PDF-1.4 body").unwrap();
        let request = JobRequest::new(SourceRef::LocalPath(file.path().to_path_buf()), "a.pdf");
        let store = SlowAckStore::default();
        let mut ctx = JobContext::new(JobId::new());

        let err = ingest(&request, &mut ctx, &store, &PipelineConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::Upload { .. }));

        let stored = store.objects.lock().unwrap().clone();
        let targets = ctx.cleanup_targets();
        for key in stored {
            assert!(
                targets.contains(&CleanupTarget::Object(key.clone())),
                "{key} would be left behind"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_upload_leaves_key_recorded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"%PDF-1.4 body").unwrap();
        let request = JobRequest::new(SourceRef::LocalPath(file.path().to_path_buf()), "a.pdf");
        let store = SlowAckStore::default();
        let mut ctx = JobContext::new(JobId::new());

        // Dropping the future mid-upload is what cancellation does.
        let config = PipelineConfig::default();
        let upload = ingest(&request, &mut ctx, &store, &config);
        let _ = tokio::time::timeout(Duration::from_secs(30), upload).await;

        assert_eq!(ctx.input_key(), Some(ctx.keys.input("a.pdf").as_str()));
    }

    #[tokio::test]
    async fn missing_local_file_is_boundary_error() {
        let source = SourceRef::LocalPath("/definitely/not/here.pdf".into());
        let err = assert_err!(fetch_source(&source, &PipelineConfig::default()).await);
        assert!(matches!(err, ReportError::Boundary(_)));
    }
}
