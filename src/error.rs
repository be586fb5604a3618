use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures of the supervised process or its command-line interface.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("service is already running")]
    AlreadyRunning,

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stopping the service timed out after {0:?}")]
    StopTimeout(Duration),

    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("could not parse an api key from `{command}` output")]
    ApiKeyParse { command: String },

    #[error("service exited with failure: {0}")]
    Exited(String),

    #[error("service config path {0} is a directory")]
    ConfigIsDir(PathBuf),

    #[error("invalid {kind} command: {command:?}")]
    InvalidCommand { kind: &'static str, command: String },
}

/// Failures on the administrative gRPC channel.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("a connection attempt is already in progress, retry later")]
    AlreadyConnecting,

    #[error("not connected to the coordination service")]
    NotConnected,

    #[error("failed to dial {target}: {reason}")]
    Dial { target: String, reason: String },

    #[error("invalid tls material: {0}")]
    Tls(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("probe call failed: {0}")]
    Probe(String),

    #[error("rpc {method} failed: {status}")]
    Rpc {
        method: &'static str,
        status: tonic::Status,
    },

    #[error("api key rotation failed: {0}")]
    Rotation(String),
}

impl ConnectionError {
    /// "Already connecting" is transient; callers may try again shortly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AlreadyConnecting)
    }
}

/// Failures fetching, installing or rolling back releases.
#[derive(Error, Debug)]
pub enum ReleaseError {
    #[error("http request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("release feed is empty")]
    EmptyFeed,

    #[error("release {tag} has no asset for platform {platform}")]
    NoMatchingAsset { tag: String, platform: String },

    #[error("failed to unpack {archive}: {reason}")]
    Archive { archive: String, reason: String },

    #[error("failed to install {path}: {source}")]
    Install {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no backup found at {0}")]
    NoBackup(PathBuf),
}

/// Operator misconfiguration. Fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Release(#[from] ReleaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_already_connecting_is_retryable() {
        assert!(ConnectionError::AlreadyConnecting.is_retryable());
        assert!(!ConnectionError::NotConnected.is_retryable());
        assert!(!ConnectionError::Probe("boom".into()).is_retryable());
    }

    #[test]
    fn category_errors_wrap_transparently() {
        let err: Error = ReleaseError::EmptyFeed.into();
        assert_eq!(err.to_string(), "release feed is empty");
        assert!(matches!(err, Error::Release(ReleaseError::EmptyFeed)));
    }
}
