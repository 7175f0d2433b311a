use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{AnalyticsError, AnalyticsResult};

pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// The `write(name, bytes) -> location` capability. Writing the same name
/// twice replaces the earlier object.
#[async_trait]
pub trait ArtifactWriter: Send + Sync {
    async fn write(&self, name: &str, bytes: &[u8], content_type: &str) -> AnalyticsResult<String>;

    fn describe(&self) -> String;
}

/// Writes artifacts below a local directory.
#[derive(Debug, Clone)]
pub struct LocalDirWriter {
    root: PathBuf,
}

impl LocalDirWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target(&self, name: &str) -> AnalyticsResult<PathBuf> {
        let relative = Path::new(name);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if name.is_empty() || !plain {
            return Err(AnalyticsError::persistence(
                name,
                "artifact names must be relative paths without `..`",
            ));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactWriter for LocalDirWriter {
    async fn write(&self, name: &str, bytes: &[u8], _content_type: &str) -> AnalyticsResult<String> {
        let target = self.target(name)?;
        let parent = target.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| AnalyticsError::persistence(name, e))?;

        // Stage next to the target and rename over it, so concurrent writers
        // of the same name never leave a torn file behind.
        let staging = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), target_file_name(&target)));
        if let Err(e) = tokio::fs::write(&staging, bytes).await {
            return Err(AnalyticsError::persistence(name, e));
        }
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(AnalyticsError::persistence(name, e));
        }

        info!(artifact = name, path = %target.display(), "artifact written");
        Ok(target.display().to_string())
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}

fn target_file_name(target: &Path) -> String {
    target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Where a bearer token for Google APIs comes from: a configured value, or
/// the runtime service account through the metadata server.
#[derive(Debug, Clone)]
pub enum TokenSource {
    Static(String),
    MetadataServer(String),
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
}

impl TokenSource {
    /// Metadata-server tokens are fetched on every call; they expire within
    /// the hour.
    pub async fn bearer(&self, client: &reqwest::Client) -> Result<String, String> {
        match self {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::MetadataServer(url) => {
                let response = client
                    .get(url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| format!("no access token: {e}"))?;
                let token: MetadataToken = response
                    .json()
                    .await
                    .map_err(|e| format!("bad token response: {e}"))?;
                Ok(token.access_token)
            }
        }
    }
}

/// Uploads artifacts to a Cloud Storage bucket through the JSON API.
#[derive(Debug, Clone)]
pub struct GcsWriter {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    token: TokenSource,
}

impl GcsWriter {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>, token: TokenSource) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            token,
        }
    }

    async fn access_token(&self, name: &str) -> AnalyticsResult<String> {
        self.token
            .bearer(&self.client)
            .await
            .map_err(|e| AnalyticsError::persistence(name, e))
    }
}

#[async_trait]
impl ArtifactWriter for GcsWriter {
    async fn write(&self, name: &str, bytes: &[u8], content_type: &str) -> AnalyticsResult<String> {
        let token = self.access_token(name).await?;
        let url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.endpoint,
            urlencoding::encode(&self.bucket),
            urlencoding::encode(name)
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| AnalyticsError::persistence(name, format!("upload failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalyticsError::persistence(
                name,
                format!("bucket {} rejected upload with {status}: {body}", self.bucket),
            ));
        }

        let location = format!("gs://{}/{}", self.bucket, name);
        info!(artifact = name, %location, "artifact uploaded");
        Ok(location)
    }

    fn describe(&self) -> String {
        format!("bucket gs://{}", self.bucket)
    }
}
