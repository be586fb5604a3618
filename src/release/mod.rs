//! Release feed queries, download and atomic install of the service binary.

mod feed;
mod install;

pub use feed::{Asset, GithubFeed, Release, ReleaseSource};
pub use install::{
    backup_path, extract_binary, install_atomic, rollback, select_asset, set_executable,
    ArchiveKind, Platform,
};

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::error::ReleaseError;
use install::file_name_from_url;

pub struct ReleaseManager {
    source: Arc<dyn ReleaseSource>,
    binary_path: PathBuf,
    temp_dir: PathBuf,
    template_url: String,
    platform: Platform,
    latest_known: RwLock<Option<Arc<Release>>>,
}

impl ReleaseManager {
    pub fn new(
        source: Arc<dyn ReleaseSource>,
        binary_path: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
        template_url: impl Into<String>,
    ) -> Self {
        Self {
            source,
            binary_path: binary_path.into(),
            temp_dir: temp_dir.into(),
            template_url: template_url.into(),
            platform: Platform::current(),
            latest_known: RwLock::new(None),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub async fn list_releases(&self) -> Result<Vec<Release>, ReleaseError> {
        self.source.list().await
    }

    /// Newest release in the feed.
    pub async fn latest(&self) -> Result<Release, ReleaseError> {
        self.source
            .list()
            .await?
            .into_iter()
            .next()
            .ok_or(ReleaseError::EmptyFeed)
    }

    /// Download release `id` for this platform and swap it in.
    pub async fn install(&self, id: u64) -> Result<Release, ReleaseError> {
        let release = self.source.get(id).await?;
        let asset = select_asset(&release, &self.platform)?;
        info!(
            tag = %release.tag_name,
            platform = %self.platform.label(),
            url = %asset.browser_download_url,
            "Installing release"
        );

        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|source| ReleaseError::Install {
                path: self.temp_dir.clone(),
                source,
            })?;

        let file_name = file_name_from_url(&asset.browser_download_url);
        let download = self.temp_dir.join(file_name);
        self.source
            .download(&asset.browser_download_url, &download)
            .await?;

        let staged = match ArchiveKind::detect(file_name) {
            Some(kind) => {
                let binary_name = self.binary_name();
                let staged = self.temp_dir.join(format!("{}.extracted", binary_name));
                let (archive, dest) = (download.clone(), staged.clone());
                tokio::task::spawn_blocking(move || {
                    extract_binary(&archive, kind, &binary_name, &dest)
                })
                .await
                .map_err(|e| ReleaseError::Archive {
                    archive: download.display().to_string(),
                    reason: e.to_string(),
                })??;
                let _ = tokio::fs::remove_file(&download).await;
                staged
            }
            None => download,
        };

        set_executable(&staged)?;
        install_atomic(&staged, &self.binary_path)?;
        let _ = tokio::fs::remove_file(&staged).await;

        Ok(release)
    }

    /// Install the newest release and remember it as the latest known.
    pub async fn update(&self) -> Result<Release, ReleaseError> {
        let latest = self.latest().await?;
        let installed = self.install(latest.id).await?;
        self.set_latest_known(installed.clone());
        Ok(installed)
    }

    pub fn rollback(&self) -> Result<(), ReleaseError> {
        rollback(&self.binary_path)
    }

    /// Returns the newer release when the feed moved past the latest known
    /// one. Never installs.
    pub async fn check_for_update(&self) -> Result<Option<Release>, ReleaseError> {
        let latest = self.latest().await?;
        let known_id = self.latest_known().map(|r| r.id).unwrap_or(0);

        if latest.id > known_id {
            info!(tag = %latest.tag_name, "New release available");
            self.set_latest_known(latest.clone());
            Ok(Some(latest))
        } else {
            debug!(tag = %latest.tag_name, "Release is current");
            Ok(None)
        }
    }

    pub fn latest_known(&self) -> Option<Arc<Release>> {
        match self.latest_known.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_latest_known(&self, release: Release) {
        let next = Some(Arc::new(release));
        match self.latest_known.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Fetch the service's example config and install it at `dest`.
    pub async fn download_config_template(&self, dest: &Path) -> Result<(), ReleaseError> {
        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|source| ReleaseError::Install {
                path: self.temp_dir.clone(),
                source,
            })?;

        let staged = self.temp_dir.join("config-template.yaml");
        self.source.download(&self.template_url, &staged).await?;
        install_atomic(&staged, dest)?;
        let _ = tokio::fs::remove_file(&staged).await;
        Ok(())
    }

    fn binary_name(&self) -> String {
        self.binary_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "headscale".to_string())
    }
}
