use async_trait::async_trait;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::{sync::Arc, time::Duration};

use crate::error::{ArchiveError, StorageError};
use crate::models::RepositoryRef;
use crate::storage::StorageClient;
use crate::store::RowStore;

pub const DEFAULT_BUCKET: &str = "codeatcommits";
const GITHUB_API_URL: &str = "https://api.github.com";

#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn contains(&self, key: &str) -> Result<bool, StorageError>;
    async fn upload(&self, key: &str, body: Vec<u8>, sha256: &str) -> Result<(), StorageError>;
}

#[async_trait]
impl ArchiveSink for StorageClient {
    async fn contains(&self, key: &str) -> Result<bool, StorageError> {
        self.object_exists(key).await
    }

    async fn upload(&self, key: &str, body: Vec<u8>, sha256: &str) -> Result<(), StorageError> {
        self.put_object(key, body, sha256).await
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub uploaded: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum ArchiveOutcome {
    Uploaded,
    AlreadyPresent,
}

#[derive(Debug, PartialEq, Eq)]
struct Snapshot {
    owner: String,
    name: String,
    revision: String,
}

impl Snapshot {
    fn parse(repo_ref: &RepositoryRef) -> Result<Self, ArchiveError> {
        let path = repo_ref
            .repository
            .trim()
            .trim_start_matches("https://github.com/")
            .trim_end_matches(".git")
            .trim_matches('/');
        let mut parts = path.split('/');
        let (Some(owner), Some(name)) = (parts.next(), parts.next()) else {
            return Err(ArchiveError::InvalidRepository(repo_ref.repository.clone()));
        };
        if owner.is_empty() || name.is_empty() || repo_ref.base_revision.is_empty() {
            return Err(ArchiveError::InvalidRepository(repo_ref.repository.clone()));
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
            revision: repo_ref.base_revision.clone(),
        })
    }

    fn object_key(&self) -> String {
        format!("{}-{}-{}.zip", self.owner, self.name, self.revision)
    }
}

pub struct ArchiveJob {
    store: Arc<dyn RowStore>,
    sink: Arc<dyn ArchiveSink>,
    client: Client,
    api_url: String,
    token: Option<String>,
}

impl ArchiveJob {
    pub fn new(
        store: Arc<dyn RowStore>,
        sink: Arc<dyn ArchiveSink>,
        token: Option<String>,
    ) -> Result<Self, ArchiveError> {
        let client = Client::builder()
            .user_agent(concat!("issuebank-task-service/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            store,
            sink,
            client,
            api_url: GITHUB_API_URL.to_string(),
            token,
        })
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub async fn run(&self) -> Result<ArchiveSummary, ArchiveError> {
        let refs = self.store.repository_refs().await?;
        tracing::info!(snapshots = refs.len(), "archival started");

        let mut summary = ArchiveSummary::default();
        for repo_ref in &refs {
            match self.archive_one(repo_ref).await {
                Ok(ArchiveOutcome::Uploaded) => summary.uploaded += 1,
                Ok(ArchiveOutcome::AlreadyPresent) => summary.skipped += 1,
                Err(err) => {
                    summary.failed += 1;
                    tracing::warn!(
                        repo = %repo_ref.repository,
                        base_commit = %repo_ref.base_revision,
                        error = %err,
                        "snapshot archival failed"
                    );
                }
            }
        }

        tracing::info!(
            uploaded = summary.uploaded,
            skipped = summary.skipped,
            failed = summary.failed,
            "archival finished"
        );
        Ok(summary)
    }

    async fn archive_one(&self, repo_ref: &RepositoryRef) -> Result<ArchiveOutcome, ArchiveError> {
        let snapshot = Snapshot::parse(repo_ref)?;
        let key = snapshot.object_key();
        if self.sink.contains(&key).await? {
            tracing::debug!(key = %key, "snapshot already archived");
            return Ok(ArchiveOutcome::AlreadyPresent);
        }

        let body = self.download(&snapshot).await?;
        let digest = hash_bytes(&body);
        let size = body.len();
        self.sink.upload(&key, body, &digest).await?;
        tracing::info!(key = %key, bytes = size, sha256 = %digest, "snapshot archived");
        Ok(ArchiveOutcome::Uploaded)
    }

    async fn download(&self, snapshot: &Snapshot) -> Result<Vec<u8>, ArchiveError> {
        let url = format!(
            "{}/repos/{}/{}/zipball/{}",
            self.api_url.trim_end_matches('/'),
            snapshot.owner,
            snapshot.name,
            snapshot.revision
        );
        let mut request = self.client.get(url.as_str());
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ArchiveError::Download {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
