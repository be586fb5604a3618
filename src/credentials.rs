use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ProcessError};

/// Issues a fresh administrative API key, retiring the previous one.
#[async_trait]
pub trait KeyRotator: Send + Sync {
    async fn rotate_api_key(&self) -> Result<String, ProcessError>;
}

/// Durable home of the administrative API key.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_api_key(&self) -> Result<Option<String>, ConfigError>;
    async fn save_api_key(&self, key: &str) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
}

/// Keeps the key in a small JSON document (`state.json` in the data dir).
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_state(&self) -> Result<PersistedState, ConfigError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| ConfigError::Read {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(e) => Err(ConfigError::Read {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load_api_key(&self) -> Result<Option<String>, ConfigError> {
        let state = self.read_state().await?;
        tracing::trace!(path = %self.path.display(), present = state.api_key.is_some(), "Loaded credential state");
        Ok(state.api_key.filter(|k| !k.is_empty()))
    }

    async fn save_api_key(&self, key: &str) -> Result<(), ConfigError> {
        let write_err = |reason: String| ConfigError::Write {
            path: self.path.clone(),
            reason,
        };

        let mut state = self.read_state().await.unwrap_or_default();
        state.api_key = Some(key.to_string());

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_err(e.to_string()))?;
        }
        let content =
            serde_json::to_string_pretty(&state).map_err(|e| write_err(e.to_string()))?;

        // Write beside the target, then rename into place.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| write_err(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| write_err(e.to_string()))?;

        tracing::debug!(path = %self.path.display(), "Persisted api key");
        Ok(())
    }
}
