use flate2::read::GzDecoder;
use std::ffi::OsString;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::Archive;
use zip::ZipArchive;

use super::feed::{Asset, Release};
use crate::error::ReleaseError;

/// Files published next to the binaries that are never the binary itself.
const NON_BINARY_SUFFIXES: &[&str] = &[".deb", ".rpm", ".apk", ".sha256", ".sig", ".pem", ".txt"];

/// Go-style platform naming used by the release assets (`linux_amd64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
}

impl Platform {
    pub fn current() -> Self {
        let os = if cfg!(target_os = "macos") {
            "darwin"
        } else if cfg!(target_os = "linux") {
            "linux"
        } else if cfg!(target_os = "windows") {
            "windows"
        } else if cfg!(target_os = "freebsd") {
            "freebsd"
        } else {
            "unknown"
        };

        let arch = if cfg!(target_arch = "x86_64") {
            "amd64"
        } else if cfg!(target_arch = "aarch64") {
            "arm64"
        } else if cfg!(target_arch = "x86") {
            "386"
        } else if cfg!(target_arch = "arm") {
            "arm"
        } else {
            "unknown"
        };

        Self { os, arch }
    }

    pub fn label(&self) -> String {
        format!("{}_{}", self.os, self.arch)
    }
}

/// Pick the asset whose file name carries `platform` as a whole token.
/// OS packages and checksum files never qualify.
pub fn select_asset<'a>(release: &'a Release, platform: &Platform) -> Result<&'a Asset, ReleaseError> {
    let label = platform.label();
    release
        .assets
        .iter()
        .filter(|asset| names_platform(file_name_from_url(&asset.browser_download_url), &label))
        .find(|asset| !is_non_binary(&asset.browser_download_url))
        .ok_or_else(|| ReleaseError::NoMatchingAsset {
            tag: release.tag_name.clone(),
            platform: label,
        })
}

/// `label` followed by the end of the name or a separator, so `linux_arm`
/// does not match `linux_arm64`.
fn names_platform(file_name: &str, label: &str) -> bool {
    file_name.match_indices(label).any(|(at, _)| {
        file_name[at + label.len()..]
            .chars()
            .next()
            .map_or(true, |c| matches!(c, '.' | '-' | '_'))
    })
}

fn is_non_binary(url: &str) -> bool {
    let lower = url.to_lowercase();
    NON_BINARY_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

/// Last path segment of a download URL.
pub fn file_name_from_url(url: &str) -> &str {
    url.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("download")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Zip,
}

impl ArchiveKind {
    pub fn detect(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

/// Copy the entry named `binary_name` out of `archive` into `dest`.
pub fn extract_binary(
    archive: &Path,
    kind: ArchiveKind,
    binary_name: &str,
    dest: &Path,
) -> Result<(), ReleaseError> {
    let archive_err = |reason: String| ReleaseError::Archive {
        archive: archive.display().to_string(),
        reason,
    };

    let file = fs::File::open(archive).map_err(|e| archive_err(e.to_string()))?;
    let mut buffer = Vec::new();
    let mut found = false;

    match kind {
        ArchiveKind::TarGz => {
            let mut tar = Archive::new(GzDecoder::new(file));
            let entries = tar
                .entries()
                .map_err(|e| archive_err(format!("failed to read tar archive: {}", e)))?;
            for entry in entries {
                let mut entry =
                    entry.map_err(|e| archive_err(format!("failed to read tar entry: {}", e)))?;
                let path = entry
                    .path()
                    .map_err(|e| archive_err(format!("failed to read entry path: {}", e)))?;
                if path.file_name().and_then(|s| s.to_str()) == Some(binary_name) {
                    entry
                        .read_to_end(&mut buffer)
                        .map_err(|e| archive_err(format!("failed to read binary: {}", e)))?;
                    found = true;
                    break;
                }
            }
        }
        ArchiveKind::Zip => {
            let mut zip = ZipArchive::new(file)
                .map_err(|e| archive_err(format!("failed to read zip archive: {}", e)))?;
            for i in 0..zip.len() {
                let mut entry = zip
                    .by_index(i)
                    .map_err(|e| archive_err(format!("failed to read zip entry: {}", e)))?;
                if Path::new(entry.name()).file_name().and_then(|s| s.to_str()) == Some(binary_name)
                {
                    entry
                        .read_to_end(&mut buffer)
                        .map_err(|e| archive_err(format!("failed to read binary: {}", e)))?;
                    found = true;
                    break;
                }
            }
        }
    }

    if !found {
        return Err(archive_err(format!("binary '{}' not found in archive", binary_name)));
    }

    fs::write(dest, buffer).map_err(|source| ReleaseError::Install {
        path: dest.to_path_buf(),
        source,
    })
}

pub fn set_executable(path: &Path) -> Result<(), ReleaseError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let install_err = |source: std::io::Error| ReleaseError::Install {
            path: path.to_path_buf(),
            source,
        };
        let mut perms = fs::metadata(path).map_err(install_err)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).map_err(install_err)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// The single rollback generation kept next to `target`.
pub fn backup_path(target: &Path) -> PathBuf {
    with_suffix(target, ".back")
}

/// Put `staged` at `target`, keeping the previous file as `<target>.back`.
///
/// The staged file is first copied beside the target so the final step is
/// a same-directory rename even when the temp dir is on another filesystem.
pub fn install_atomic(staged: &Path, target: &Path) -> Result<(), ReleaseError> {
    let install_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| ReleaseError::Install { path, source }
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(install_err(parent))?;
    }

    let sibling = with_suffix(target, ".new");
    fs::copy(staged, &sibling).map_err(install_err(&sibling))?;

    if target.exists() {
        let backup = backup_path(target);
        fs::rename(target, &backup).map_err(install_err(&backup))?;
        tracing::debug!(backup = %backup.display(), "Kept previous generation");
    }

    fs::rename(&sibling, target).map_err(install_err(target))?;
    tracing::info!(path = %target.display(), "Installed");
    Ok(())
}

/// Restore `<target>.back` over `target`.
pub fn rollback(target: &Path) -> Result<(), ReleaseError> {
    let backup = backup_path(target);
    if !backup.is_file() {
        return Err(ReleaseError::NoBackup(backup));
    }

    if target.exists() {
        fs::remove_file(target).map_err(|source| ReleaseError::Install {
            path: target.to_path_buf(),
            source,
        })?;
    }
    fs::rename(&backup, target).map_err(|source| ReleaseError::Install {
        path: target.to_path_buf(),
        source,
    })?;

    tracing::info!(path = %target.display(), "Rolled back to previous generation");
    Ok(())
}
