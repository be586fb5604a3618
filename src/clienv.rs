use std::path::PathBuf;

const ENV_CONFIG: &str = "MESHWARDEN_CONFIG";
const ENV_DATA_DIR: &str = "MESHWARDEN_DATA_DIR";
const ENV_API_KEY: &str = "MESHWARDEN_API_KEY";
const ENV_RELEASE_INDEX: &str = "MESHWARDEN_RELEASE_INDEX";
const ENV_LOG: &str = "RUST_LOG";

const FALLBACK_CONFIG_DIR: &str = "/etc";
const FALLBACK_DATA_DIR: &str = "/var/lib";
const APP_SUBDIR: &str = "meshwarden";

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Config directory (~/.config/meshwarden, or /etc/meshwarden without a home)
pub fn config_dir() -> PathBuf {
    let dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
        .join(APP_SUBDIR);
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Config file path ($MESHWARDEN_CONFIG or <config_dir>/config.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(ENV_CONFIG)
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir().join("config.toml"));
    tracing::trace!(path = %path.display(), "Resolved config path");
    path
}

/// Data directory ($MESHWARDEN_DATA_DIR or ~/.local/share/meshwarden)
pub fn data_dir() -> PathBuf {
    let dir = env_opt(ENV_DATA_DIR).map(PathBuf::from).unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
            .join(APP_SUBDIR)
    });
    tracing::trace!(dir = %dir.display(), "Resolved data directory");
    dir
}

/// API key override ($MESHWARDEN_API_KEY)
pub fn api_key() -> Option<String> {
    let val = env_opt(ENV_API_KEY);
    tracing::trace!(present = val.is_some(), "MESHWARDEN_API_KEY env var");
    val
}

/// Release index override ($MESHWARDEN_RELEASE_INDEX)
pub fn release_index() -> Option<String> {
    let val = env_opt(ENV_RELEASE_INDEX);
    tracing::trace!(value = ?val, "MESHWARDEN_RELEASE_INDEX env var");
    val
}

/// Log filter ($RUST_LOG)
pub fn log_filter() -> Option<String> {
    env_opt(ENV_LOG)
}

/// True when running inside a container (`/.dockerenv` exists)
pub fn in_container() -> bool {
    std::path::Path::new("/.dockerenv").exists()
}
