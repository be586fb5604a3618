use std::path::{Path, PathBuf};
use std::process::Stdio;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ProcessError;

/// An operator-supplied command, split on whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    raw: String,
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn parse(kind: &'static str, raw: &str) -> Result<Self, ProcessError> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| ProcessError::InvalidCommand {
            kind,
            command: raw.to_string(),
        })?;
        Ok(Self {
            raw: raw.to_string(),
            program,
            args: parts.collect(),
        })
    }

    pub async fn run(&self) -> Result<(), ProcessError> {
        debug!(command = %self.raw, "Running service manager command");
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ProcessError::Spawn {
                command: self.raw.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProcessError::Command {
                command: self.raw.clone(),
                reason: format!("{}: {}", output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}

/// Drives a service manager (systemd, launchd, ...) through start/stop
/// commands; liveness comes from the host process table.
pub struct DelegatedBackend {
    app: PathBuf,
    config: PathBuf,
    start: CommandLine,
    stop: CommandLine,
    restart: Option<CommandLine>,
}

impl DelegatedBackend {
    pub fn new(
        app: PathBuf,
        config: PathBuf,
        start: &str,
        stop: &str,
        restart: Option<&str>,
    ) -> Result<Self, ProcessError> {
        Ok(Self {
            app,
            config,
            start: CommandLine::parse("start", start)?,
            stop: CommandLine::parse("stop", stop)?,
            restart: restart.map(|r| CommandLine::parse("restart", r)).transpose()?,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        let Some(name) = self.app.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return false;
        };
        tokio::task::spawn_blocking(move || process_running(&name))
            .await
            .unwrap_or(false)
    }

    pub async fn start(&self) -> Result<(), ProcessError> {
        self.start.run().await?;
        info!(command = %self.start.raw, "Service started through service manager");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ProcessError> {
        self.stop.run().await?;
        info!(command = %self.stop.raw, "Service stopped through service manager");
        Ok(())
    }

    /// Uses the dedicated restart command when configured.
    pub async fn restart(&self) -> Option<Result<(), ProcessError>> {
        let restart = self.restart.as_ref()?;
        let result = restart.run().await;
        if result.is_ok() {
            info!(command = %restart.raw, "Service restarted through service manager");
        }
        Some(result)
    }
}

/// Whether any process on the host carries `name`.
pub fn process_running(name: &str) -> bool {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());
    system
        .processes()
        .values()
        .any(|process| process.name().to_string_lossy() == name)
}
