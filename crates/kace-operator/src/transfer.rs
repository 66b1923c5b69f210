//! Data repository file transfer
//!
//! [`FileTransfer`] is the boundary to the versioned data repository: list,
//! download and upload objects, resolve commits. [`LakeFsClient`] implements
//! it over the lakeFS REST API.

use crate::error::{OperatorError, Result};
use crate::release::{next_release_tag, stable_branch_name};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Maximum error body bytes kept in an error message
const MAX_ERROR_BODY_BYTES: usize = 4096;

/// Page size for paginated listings
const PAGE_SIZE: u32 = 1000;

/// An object in the data repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub path: String,
    #[serde(rename = "size_bytes", default)]
    pub size: u64,
}

/// A commit in the data repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: String,
    pub committer: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub creation_date: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A local file to publish under a remote directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
    pub local_path: PathBuf,
    pub remote_dir: String,
}

impl LocalArtifact {
    pub fn new(local_path: impl Into<PathBuf>, remote_dir: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            remote_dir: remote_dir.into(),
        }
    }

    /// `{remote_dir}/{file name}`
    pub fn remote_path(&self) -> String {
        let file_name = self
            .local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = self.remote_dir.trim_matches('/');
        if dir.is_empty() {
            file_name
        } else {
            format!("{}/{}", dir, file_name)
        }
    }
}

/// Branch and tag created by a publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedRelease {
    pub branch_name: String,
    pub tag_name: String,
}

/// Versioned data repository operations
#[async_trait]
pub trait FileTransfer: Send + Sync {
    async fn list_objects(&self, repo: &str, reference: &str, prefix: &str)
        -> Result<Vec<ObjectInfo>>;

    async fn download(&self, repo: &str, reference: &str, path: &str) -> Result<Vec<u8>>;

    /// Publish files on a fresh release branch cut from `root_branch` and tag it
    async fn upload(
        &self,
        repo: &str,
        root_branch: &str,
        artifacts: &[LocalArtifact],
    ) -> Result<PublishedRelease>;

    async fn resolve_commit(&self, repo: &str, commit_id: &str) -> Result<CommitInfo>;

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>>;
}

/// Builder for [`LakeFsClient`]
#[derive(Debug, Default)]
pub struct LakeFsClientBuilder {
    url: Option<String>,
    access_key: Option<String>,
    secret_key: Option<SecretString>,
    timeout: Option<Duration>,
}

impl LakeFsClientBuilder {
    /// lakeFS server URL, without the `/api/v1` suffix
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn access_key(mut self, key: impl Into<String>) -> Self {
        self.access_key = Some(key.into());
        self
    }

    pub fn secret_key(mut self, key: SecretString) -> Self {
        self.secret_key = Some(key);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<LakeFsClient> {
        let url = self
            .url
            .ok_or_else(|| OperatorError::InvalidConfig("lakefs url is required".to_string()))?;
        if !url.starts_with("https://") && !url.starts_with("http://") {
            return Err(OperatorError::InvalidConfig(format!(
                "lakefs url must start with http:// or https://, got: {url}"
            )));
        }
        let access_key = self.access_key.unwrap_or_default();
        let secret_key = self
            .secret_key
            .unwrap_or_else(|| SecretString::from(String::new()));

        let client = reqwest::Client::builder()
            .timeout(self.timeout.unwrap_or(Duration::from_secs(300)))
            .build()?;

        let api_url = format!("{}/api/v1", url.trim_end_matches('/'));
        debug!(url = %api_url, "lakeFS client initialized");
        Ok(LakeFsClient {
            api_url,
            access_key,
            secret_key,
            client,
        })
    }
}

#[derive(Deserialize)]
struct Pagination {
    has_more: bool,
    #[serde(default)]
    next_offset: String,
}

#[derive(Deserialize)]
struct Page<T> {
    pagination: Pagination,
    results: Vec<T>,
}

#[derive(Deserialize)]
struct TagRef {
    id: String,
}

#[derive(Deserialize)]
struct LakeFsError {
    message: String,
}

/// lakeFS REST client
pub struct LakeFsClient {
    api_url: String,
    access_key: String,
    secret_key: SecretString,
    client: reqwest::Client,
}

impl std::fmt::Debug for LakeFsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LakeFsClient")
            .field("api_url", &self.api_url)
            .field("access_key", &self.access_key)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

impl LakeFsClient {
    pub fn builder() -> LakeFsClientBuilder {
        LakeFsClientBuilder::default()
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .basic_auth(&self.access_key, Some(self.secret_key.expose_secret()))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = match response.bytes().await {
            Ok(b) => String::from_utf8_lossy(&b[..b.len().min(MAX_ERROR_BODY_BYTES)]).to_string(),
            Err(_) => String::new(),
        };
        let message = serde_json::from_str::<LakeFsError>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        Err(OperatorError::Transfer { status, message })
    }

    async fn paginate<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let mut results = Vec::new();
        let mut after = String::new();
        let amount = PAGE_SIZE.to_string();
        loop {
            let mut params: Vec<(&str, &str)> = query.to_vec();
            params.push(("amount", amount.as_str()));
            if !after.is_empty() {
                params.push(("after", after.as_str()));
            }
            let response = self
                .request(reqwest::Method::GET, path)
                .query(&params)
                .send()
                .await?;
            let page: Page<T> = Self::check(response).await?.json().await?;
            results.extend(page.results);
            if !page.pagination.has_more || page.pagination.next_offset.is_empty() {
                return Ok(results);
            }
            after = page.pagination.next_offset;
        }
    }

    /// Create a branch; an existing branch of the same name is kept
    async fn create_branch(&self, repo: &str, name: &str, source: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &format!("/repositories/{repo}/branches"))
            .json(&serde_json::json!({ "name": name, "source": source }))
            .send()
            .await?;
        match Self::check(response).await {
            Ok(_) => {
                info!(repo = %repo, branch = %name, source = %source, "Created branch");
                Ok(())
            }
            Err(OperatorError::Transfer { status: 409, message }) => {
                warn!(repo = %repo, branch = %name, %message, "Branch already exists, reusing it");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn upload_object(&self, repo: &str, branch: &str, path: &str, body: Vec<u8>) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/repositories/{repo}/branches/{branch}/objects"),
            )
            .query(&[("path", path)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;
        Self::check(response).await?;
        debug!(repo = %repo, branch = %branch, path = %path, "Uploaded object");
        Ok(())
    }

    async fn commit(&self, repo: &str, branch: &str, message: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/repositories/{repo}/branches/{branch}/commits"),
            )
            .json(&serde_json::json!({ "message": message, "metadata": {} }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn create_tag(&self, repo: &str, tag: &str, reference: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &format!("/repositories/{repo}/tags"))
            .json(&serde_json::json!({ "id": tag, "ref": reference }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl FileTransfer for LakeFsClient {
    async fn list_objects(
        &self,
        repo: &str,
        reference: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>> {
        self.paginate(
            &format!("/repositories/{repo}/refs/{reference}/objects/ls"),
            &[("prefix", prefix)],
        )
        .await
    }

    async fn download(&self, repo: &str, reference: &str, path: &str) -> Result<Vec<u8>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repositories/{repo}/refs/{reference}/objects"),
            )
            .query(&[("path", path)])
            .send()
            .await?;
        let bytes = Self::check(response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    #[instrument(skip(self, artifacts), fields(files = artifacts.len()))]
    async fn upload(
        &self,
        repo: &str,
        root_branch: &str,
        artifacts: &[LocalArtifact],
    ) -> Result<PublishedRelease> {
        let tags = self.list_tags(repo).await?;
        let tag_name = next_release_tag(&tags);
        let branch_name = stable_branch_name(&tag_name);

        self.create_branch(repo, &branch_name, root_branch).await?;
        for artifact in artifacts {
            let body = tokio::fs::read(&artifact.local_path).await?;
            self.upload_object(repo, &branch_name, &artifact.remote_path(), body)
                .await?;
        }
        self.commit(repo, &branch_name, &format!("HDT Uploads for version {tag_name}"))
            .await?;
        self.create_tag(repo, &tag_name, &branch_name).await?;

        info!(branch = %branch_name, tag = %tag_name, "Published release");
        Ok(PublishedRelease {
            branch_name,
            tag_name,
        })
    }

    async fn resolve_commit(&self, repo: &str, commit_id: &str) -> Result<CommitInfo> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repositories/{repo}/commits/{commit_id}"),
            )
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        let tags: Vec<TagRef> = self
            .paginate(&format!("/repositories/{repo}/tags"), &[])
            .await?;
        Ok(tags.into_iter().map(|t| t.id).collect())
    }
}

/// Write downloaded bytes to `path`, creating parent directories
pub async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Local relative path for a remote object key
///
/// Keys are joined onto local data directories, so absolute keys and keys
/// with `..` components are rejected.
pub fn relative_object_path(key: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(key).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(OperatorError::UnsafePath(key.to_string()));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(OperatorError::UnsafePath(key.to_string()));
    }
    Ok(relative)
}
