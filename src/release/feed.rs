use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::error::ReleaseError;

const USER_AGENT: &str = concat!("meshwarden/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: u64,
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    #[serde(default)]
    pub name: String,
    pub browser_download_url: String,
}

/// Where releases and their files come from.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Every published release, newest first.
    async fn list(&self) -> Result<Vec<Release>, ReleaseError>;

    async fn get(&self, id: u64) -> Result<Release, ReleaseError>;

    /// Stream `url` into `dest`, replacing any existing file.
    async fn download(&self, url: &str, dest: &Path) -> Result<(), ReleaseError>;
}

/// GitHub-style releases API.
pub struct GithubFeed {
    client: reqwest::Client,
    index_url: String,
    download_timeout: Option<Duration>,
}

impl GithubFeed {
    pub fn new(index_url: &str, download_timeout: Option<Duration>) -> Result<Self, ReleaseError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ReleaseError::Http {
                url: index_url.to_string(),
                reason: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            index_url: index_url.trim_end_matches('/').to_string(),
            download_timeout,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ReleaseError> {
        let http_err = |reason: String| ReleaseError::Http {
            url: url.to_string(),
            reason,
        };

        tracing::debug!(url, "Fetching release metadata");
        let response = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| http_err(e.to_string()))?;

        if !response.status().is_success() {
            return Err(http_err(format!("server returned status {}", response.status())));
        }

        response
            .json()
            .await
            .map_err(|e| http_err(format!("failed to parse JSON: {}", e)))
    }
}

#[async_trait]
impl ReleaseSource for GithubFeed {
    async fn list(&self) -> Result<Vec<Release>, ReleaseError> {
        self.get_json(&self.index_url).await
    }

    async fn get(&self, id: u64) -> Result<Release, ReleaseError> {
        self.get_json(&format!("{}/{}", self.index_url, id)).await
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), ReleaseError> {
        let download_err = |reason: String| ReleaseError::Download {
            url: url.to_string(),
            reason,
        };

        let mut request = self.client.get(url);
        if let Some(timeout) = self.download_timeout {
            request = request.timeout(timeout);
        }

        tracing::info!(url, dest = %dest.display(), "Downloading");
        let mut response = request
            .send()
            .await
            .map_err(|e| download_err(e.to_string()))?;

        if !response.status().is_success() {
            return Err(download_err(format!(
                "server returned status {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| download_err(format!("failed to create {}: {}", dest.display(), e)))?;

        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| download_err(e.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| download_err(e.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| download_err(e.to_string()))?;

        tracing::debug!(url, bytes = written, "Download complete");
        Ok(())
    }
}
