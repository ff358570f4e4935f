//! Object storage: the only resource shared between stages of one job.
//!
//! Every stage writes and reads only its own well-known keys under the job
//! namespace (`jobs/{id}/…`), so nothing here needs locking beyond
//! write-once, read-many, delete-once.
//!
//! ## Two-path writes
//!
//! A direct authenticated write is tried first under a time bound. If it
//! fails or times out, the same bytes are written once more through a
//! signed (pre-authorised) URL. [`upload_with_fallback`] implements this for
//! both the bucket probe and the real document upload.

pub mod gcs;

pub use gcs::{GcsSettings, GcsStore};

use crate::error::ReportError;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from a single storage operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("storage request failed: {0}")]
    Transport(String),

    #[error("storage operation timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage misconfigured: {0}")]
    Configuration(String),
}

/// Durable blob storage for documents and intermediate artefacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket (or container) name, used to build URIs for the OCR service.
    fn bucket(&self) -> &str;

    /// `gs://bucket/key` URI of an object.
    fn uri(&self, key: &str) -> String {
        format!("gs://{}/{}", self.bucket(), key)
    }

    /// Direct authenticated write.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), StoreError>;

    /// Write through a signed URL instead of the authenticated API.
    async fn put_signed(&self, key: &str, bytes: &[u8], content_type: &str)
        -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Keys starting with `prefix`, in lexical order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Delete one object. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Delete every object under `prefix`; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let keys = self.list(prefix).await?;
        let mut deleted = 0usize;
        for key in &keys {
            match self.delete(key).await {
                Ok(()) | Err(StoreError::NotFound(_)) => deleted += 1,
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}

/// Which write path an upload ended up using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPath {
    Direct,
    SignedUrl,
}

impl UploadPath {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadPath::Direct => "direct",
            UploadPath::SignedUrl => "signed-url",
        }
    }
}

async fn bounded<F>(limit: Duration, op: F) -> Result<(), StoreError>
where
    F: std::future::Future<Output = Result<(), StoreError>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            secs: limit.as_secs(),
        }),
    }
}

/// Write `bytes` to `key`: direct first, then once via signed URL.
///
/// Both paths failing is fatal ([`ReportError::Upload`]); every later stage
/// depends on the object existing.
pub async fn upload_with_fallback(
    store: &dyn ObjectStore,
    key: &str,
    bytes: &[u8],
    content_type: &str,
    limit: Duration,
) -> Result<UploadPath, ReportError> {
    debug!("Uploading {} bytes to {}", bytes.len(), key);
    let direct = match bounded(limit, store.put(key, bytes, content_type)).await {
        Ok(()) => return Ok(UploadPath::Direct),
        Err(e) => e,
    };
    warn!("Direct write of {} failed ({}); retrying via signed URL", key, direct);

    match bounded(limit, store.put_signed(key, bytes, content_type)).await {
        Ok(()) => {
            info!("Signed-URL write of {} succeeded", key);
            Ok(UploadPath::SignedUrl)
        }
        Err(signed) => Err(ReportError::Upload {
            key: key.to_string(),
            direct: direct.to_string(),
            signed: signed.to_string(),
        }),
    }
}

/// Small write that proves the bucket is reachable and writable before the
/// real document goes up.
pub async fn probe_bucket(
    store: &dyn ObjectStore,
    key: &str,
    limit: Duration,
) -> Result<UploadPath, ReportError> {
    upload_with_fallback(store, key, b"probe", "text/plain", limit).await
}
