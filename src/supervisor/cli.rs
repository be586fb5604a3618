use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ProcessError;

pub const UNKNOWN_VERSION: &str = "Unknown";

async fn run(app: &Path, args: &[&str]) -> Result<String, ProcessError> {
    let rendered = format!("{} {}", app.display(), args.join(" "));
    debug!(command = %rendered, "Running service command");

    let output = Command::new(app)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| ProcessError::Spawn {
            command: rendered.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProcessError::Command {
            command: rendered,
            reason: format!("{}: {}", output.status, stderr.trim()),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `<app> version`, or [`UNKNOWN_VERSION`] when it cannot be determined.
pub async fn version(app: &Path) -> String {
    match run(app, &["version"]).await {
        Ok(out) => out
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
        Err(e) => {
            warn!(error = %e, "Failed to query service version");
            UNKNOWN_VERSION.to_string()
        }
    }
}

/// `<app> apikey create -c <config>`.
pub async fn create_api_key(app: &Path, config: &Path) -> Result<String, ProcessError> {
    let config = config.to_string_lossy();
    let out = run(app, &["apikey", "create", "-c", &config]).await?;
    parse_api_key(&out).ok_or_else(|| ProcessError::ApiKeyParse {
        command: format!("{} apikey create", app.display()),
    })
}

/// `<app> apikey expire -p <prefix> -c <config>`.
pub async fn expire_api_key(app: &Path, config: &Path, prefix: &str) -> Result<(), ProcessError> {
    let config = config.to_string_lossy();
    run(app, &["apikey", "expire", "-p", prefix, "-c", &config]).await?;
    Ok(())
}

/// The key is printed on the line before the trailing newline; anything
/// earlier is log output.
fn parse_api_key(stdout: &str) -> Option<String> {
    let lines: Vec<&str> = stdout.split('\n').collect();
    if lines.len() < 2 {
        return None;
    }
    let key = lines[lines.len() - 2].trim();
    (!key.is_empty()).then(|| key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_second_to_last_line() {
        let out = "2024-01-01T00:00:00Z INF opening database\nabc123.SecretPart\n";
        assert_eq!(parse_api_key(out).as_deref(), Some("abc123.SecretPart"));
    }

    #[test]
    fn missing_trailing_newline_or_blank_is_rejected() {
        assert_eq!(parse_api_key("abc123.SecretPart"), None);
        assert_eq!(parse_api_key("\n\n"), None);
        assert_eq!(parse_api_key(""), None);
    }

    #[tokio::test]
    async fn version_of_missing_binary_is_unknown() {
        let v = version(Path::new("/nonexistent/headscale")).await;
        assert_eq!(v, UNKNOWN_VERSION);
    }
}
