//! Google Cloud Storage over its JSON API.
//!
//! * Direct writes use `uploadType=media` with the bearer token.
//! * Signed writes ask a URL signer (a separate service holding its own
//!   credentials, e.g. a backend that mints V4 signed URLs) for a PUT URL
//!   scoped to one object, then send the bytes there with no auth header.
//!   The GCS bearer token is never involved, so a rejected or expired token
//!   on the direct path does not also sink the signed path.

use super::{ObjectStore, StoreError};
use crate::error::ReportError;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const DEFAULT_API_BASE: &str = "https://storage.googleapis.com";

/// Connection settings for [`GcsStore`].
#[derive(Clone)]
pub struct GcsSettings {
    pub bucket: String,
    pub access_token: String,
    /// Override for emulators and tests. Default: `https://storage.googleapis.com`.
    pub api_base: String,
    /// Endpoint that returns a signed PUT URL for one object. Without it the
    /// signed path is unavailable.
    pub signer_url: Option<String>,
    /// Credential for the signer, independent of `access_token`.
    pub signer_token: Option<String>,
}

impl std::fmt::Debug for GcsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsSettings")
            .field("bucket", &self.bucket)
            .field("access_token", &"<redacted>")
            .field("api_base", &self.api_base)
            .field("signer_url", &self.signer_url)
            .field("signer_token", &self.signer_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl GcsSettings {
    /// Read `DOSSIER_GCS_BUCKET`, `DOSSIER_GCP_ACCESS_TOKEN` and the optional
    /// `DOSSIER_GCS_API_BASE`, `DOSSIER_SIGNED_URL_ENDPOINT` and
    /// `DOSSIER_SIGNER_TOKEN`.
    pub fn from_env() -> Result<Self, ReportError> {
        let bucket = required_env("DOSSIER_GCS_BUCKET")?;
        let access_token = required_env("DOSSIER_GCP_ACCESS_TOKEN")?;
        let api_base =
            optional_env("DOSSIER_GCS_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Ok(Self {
            bucket,
            access_token,
            api_base,
            signer_url: optional_env("DOSSIER_SIGNED_URL_ENDPOINT"),
            signer_token: optional_env("DOSSIER_SIGNER_TOKEN"),
        })
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub(crate) fn required_env(key: &str) -> Result<String, ReportError> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ReportError::Configuration(format!("{key} is not set"))),
    }
}

/// [`ObjectStore`] backed by a GCS bucket.
pub struct GcsStore {
    settings: GcsSettings,
    base: Url,
    client: Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ListItem {
    name: String,
}

/// Signer reply: `{"url": "..."}` (or `signedUrl`).
#[derive(Deserialize)]
struct SignedUrl {
    #[serde(alias = "signedUrl")]
    url: String,
}

impl GcsStore {
    pub fn new(settings: GcsSettings) -> Result<Self, ReportError> {
        if settings.bucket.trim().is_empty() {
            return Err(ReportError::Configuration("GCS bucket name is empty".into()));
        }
        let base = Url::parse(&settings.api_base).map_err(|e| {
            ReportError::Configuration(format!("invalid GCS API base '{}': {e}", settings.api_base))
        })?;
        let client = Client::builder()
            .build()
            .map_err(|e| ReportError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            settings,
            base,
            client,
        })
    }

    /// `{base}/{segments…}`, each segment percent-encoded (object names keep their `/`).
    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Configuration("API base cannot be a base URL".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, key: &str) -> Result<Url, StoreError> {
        self.endpoint(&["storage", "v1", "b", &self.settings.bucket, "o", key])
    }

    fn upload_url(&self, key: &str, upload_type: &str) -> Result<Url, StoreError> {
        let mut url = self.endpoint(&["upload", "storage", "v1", "b", &self.settings.bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", upload_type)
            .append_pair("name", key);
        Ok(url)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.settings.access_token)
    }

    /// Request to the URL signer for a PUT of `key`. Carries only the
    /// signer's own credential.
    fn signer_request(&self, key: &str, content_type: &str) -> Result<reqwest::Request, StoreError> {
        let endpoint = self
            .settings
            .signer_url
            .as_deref()
            .ok_or_else(|| StoreError::Configuration("no signed-URL endpoint configured".into()))?;
        let mut builder = self.client.post(endpoint).json(&json!({
            "bucket": self.settings.bucket,
            "object": key,
            "method": "PUT",
            "contentType": content_type,
        }));
        if let Some(token) = &self.settings.signer_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder
            .build()
            .map_err(|e| StoreError::Configuration(format!("signer request: {e}")))
    }
}

async fn check(response: reqwest::Response, key: &str) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(StoreError::NotFound(key.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body: body.chars().take(300).collect(),
    })
}

fn transport(e: reqwest::Error) -> StoreError {
    StoreError::Transport(e.to_string())
}

#[async_trait]
impl ObjectStore for GcsStore {
    fn bucket(&self) -> &str {
        &self.settings.bucket
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), StoreError> {
        let url = self.upload_url(key, "media")?;
        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, self.bearer())
            .header(CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(transport)?;
        check(response, key).await?;
        debug!("gcs: put {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    async fn put_signed(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StoreError> {
        let request = self.signer_request(key, content_type)?;
        let response = self.client.execute(request).await.map_err(transport)?;
        let signed: SignedUrl = check(response, key)
            .await?
            .json()
            .await
            .map_err(transport)?;

        let response = self
            .client
            .put(signed.url)
            .header(CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(transport)?;
        check(response, key).await?;
        debug!("gcs: signed put {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let mut url = self.object_url(key)?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(transport)?;
        let response = check(response, key).await?;
        let bytes = response.bytes().await.map_err(transport)?;
        Ok(bytes.to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.endpoint(&["storage", "v1", "b", &self.settings.bucket, "o"])?;
            {
                let mut q = url.query_pairs_mut();
                q.append_pair("prefix", prefix);
                q.append_pair("fields", "items(name),nextPageToken");
                if let Some(ref t) = page_token {
                    q.append_pair("pageToken", t);
                }
            }
            let response = self
                .client
                .get(url)
                .header(AUTHORIZATION, self.bearer())
                .send()
                .await
                .map_err(transport)?;
            let response = check(response, prefix).await?;
            let page: ListResponse = response.json().await.map_err(transport)?;
            keys.extend(page.items.into_iter().map(|i| i.name));
            match page.next_page_token {
                Some(t) if !t.is_empty() => page_token = Some(t),
                _ => break,
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let url = self.object_url(key)?;
        let response = self
            .client
            .delete(url)
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(transport)?;
        match check(response, key).await {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GcsStore {
        GcsStore::new(GcsSettings {
            bucket: "dossiers".into(),
            access_token: "t".into(),
            api_base: DEFAULT_API_BASE.into(),
            signer_url: None,
            signer_token: None,
        })
        .unwrap()
    }

    #[test]
    fn object_names_are_encoded_as_one_segment() {
        let url = store().object_url("jobs/abc/input/a b.pdf").unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/dossiers/o/jobs%2Fabc%2Finput%2Fa%20b.pdf"
        );
    }

    #[test]
    fn upload_url_carries_type_and_name() {
        let url = store().upload_url("jobs/abc/probe.txt", "media").unwrap();
        assert!(url.path().starts_with("/upload/storage/v1/b/dossiers/o"));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("uploadType".into(), "media".into())));
        assert!(pairs.contains(&("name".into(), "jobs/abc/probe.txt".into())));
    }

    #[test]
    fn uri_uses_gs_scheme() {
        assert_eq!(store().uri("jobs/x/input/a.pdf"), "gs://dossiers/jobs/x/input/a.pdf");
    }

    #[test]
    fn empty_bucket_is_a_configuration_error() {
        let err = GcsStore::new(GcsSettings {
            bucket: " ".into(),
            access_token: "t".into(),
            api_base: DEFAULT_API_BASE.into(),
            signer_url: None,
            signer_token: None,
        })
        .err()
        .unwrap();
        assert!(matches!(err, ReportError::Configuration(_)));
    }

    #[test]
    fn settings_debug_redacts_token() {
        let s = GcsSettings {
            bucket: "b".into(),
            access_token: "secret".into(),
            api_base: DEFAULT_API_BASE.into(),
            signer_url: Some("https://signer.test/sign".into()),
            signer_token: Some("signer-secret".into()),
        };
        assert!(!format!("{s:?}").contains("secret"));
    }

    fn signing_store() -> GcsStore {
        GcsStore::new(GcsSettings {
            bucket: "dossiers".into(),
            access_token: "gcs-token".into(),
            api_base: DEFAULT_API_BASE.into(),
            signer_url: Some("https://signer.test/sign".into()),
            signer_token: Some("signer-token".into()),
        })
        .unwrap()
    }

    #[test]
    fn signer_request_uses_only_the_signer_credential() {
        let req = signing_store()
            .signer_request("jobs/abc/input/a.pdf", "application/pdf")
            .unwrap();
        assert_eq!(req.url().as_str(), "https://signer.test/sign");
        let auth = req.headers().get(AUTHORIZATION).unwrap().to_str().unwrap();
        assert_eq!(auth, "Bearer signer-token");
        assert!(!auth.contains("gcs-token"));

        let body: serde_json::Value =
            serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["object"], "jobs/abc/input/a.pdf");
        assert_eq!(body["method"], "PUT");
        assert_eq!(body["contentType"], "application/pdf");
    }

    #[tokio::test]
    async fn signed_path_without_signer_is_a_configuration_error() {
        let err = tokio_test::assert_err!(
            store()
                .put_signed("jobs/abc/probe.txt", b"probe", "text/plain")
                .await
        );
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[test]
    fn signer_reply_accepts_both_field_names() {
        let a: SignedUrl = serde_json::from_str(r#"{"url":"https://x"}"#).unwrap();
        let b: SignedUrl = serde_json::from_str(r#"{"signedUrl":"https://y"}"#).unwrap();
        assert_eq!(a.url, "https://x");
        assert_eq!(b.url, "https://y");
    }
}
