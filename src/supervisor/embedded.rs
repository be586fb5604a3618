use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::log_buffer::LogBuffer;
use crate::error::ProcessError;

/// One spawned child plus the two tasks that supervise it.
struct Run {
    cancel: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

/// Runs `<app> serve -c <config>` as a child of this process.
pub struct EmbeddedBackend {
    app: PathBuf,
    config: PathBuf,
    logs: Arc<LogBuffer>,
    stop_timeout: Duration,
    running: Arc<AtomicBool>,
    exit_error: Arc<Mutex<Option<String>>>,
    run: tokio::sync::Mutex<Option<Run>>,
}

impl EmbeddedBackend {
    pub fn new(app: PathBuf, config: PathBuf, logs: Arc<LogBuffer>, stop_timeout: Duration) -> Self {
        Self {
            app,
            config,
            logs,
            stop_timeout,
            running: Arc::new(AtomicBool::new(false)),
            exit_error: Arc::new(Mutex::new(None)),
            run: tokio::sync::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn config_path(&self) -> &Path {
        &self.config
    }

    /// Failure reported by the last child that exited on its own.
    pub fn exit_error(&self) -> Option<String> {
        match self.exit_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn start(&self) -> Result<(), ProcessError> {
        let mut run = self.run.lock().await;
        if self.is_running() {
            return Err(ProcessError::AlreadyRunning);
        }
        // A previous child exited by itself; its cancel watcher is still parked.
        if let Some(mut stale) = run.take() {
            let _ = stale.cancel.send(true);
            while stale.tasks.join_next().await.is_some() {}
        }

        let mut cmd = Command::new(&self.app);
        cmd.arg("serve")
            .arg("-c")
            .arg(&self.config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: format!("{} serve -c {}", self.app.display(), self.config.display()),
            source,
        })?;
        info!(pid = ?child.id(), app = %self.app.display(), "Started embedded service");

        spawn_log_readers(&mut child, &self.logs);
        self.running.store(true, Ordering::Release);
        if let Ok(mut guard) = self.exit_error.lock() {
            *guard = None;
        }

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let mut tasks = JoinSet::new();

        let running = Arc::clone(&self.running);
        let exit_error = Arc::clone(&self.exit_error);
        tasks.spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let failure = match status {
                        Ok(status) if status.success() => {
                            info!("Embedded service exited");
                            None
                        }
                        Ok(status) => {
                            error!(%status, "Embedded service exited with failure");
                            Some(ProcessError::Exited(status.to_string()))
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to wait for embedded service");
                            Some(ProcessError::Exited(e.to_string()))
                        }
                    };
                    if let Ok(mut guard) = exit_error.lock() {
                        *guard = failure.map(|e| e.to_string());
                    }
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill embedded service");
                    } else {
                        debug!("Embedded service killed");
                    }
                }
            }
            running.store(false, Ordering::Release);
        });

        let running = Arc::clone(&self.running);
        tasks.spawn(async move {
            // Resolves on cancel, or with an error once the sender is gone.
            let _ = cancel_rx.wait_for(|cancelled| *cancelled).await;
            if running.load(Ordering::Acquire) {
                let _ = kill_tx.send(());
            }
        });

        *run = Some(Run {
            cancel: cancel_tx,
            tasks,
        });
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ProcessError> {
        let mut run = self.run.lock().await;
        let Some(mut current) = run.take() else {
            return Ok(());
        };

        info!(app = %self.app.display(), "Stopping embedded service");
        let _ = current.cancel.send(true);

        let drained = tokio::time::timeout(self.stop_timeout, async {
            while current.tasks.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => {
                debug!("Embedded service stopped");
                Ok(())
            }
            Err(_) => {
                warn!("Embedded service did not stop in {:?}", self.stop_timeout);
                current.tasks.abort_all();
                self.running.store(false, Ordering::Release);
                Err(ProcessError::StopTimeout(self.stop_timeout))
            }
        }
    }
}

/// Forward the child's stdout/stderr lines into the log buffer.
fn spawn_log_readers(child: &mut Child, logs: &Arc<LogBuffer>) {
    if let Some(stdout) = child.stdout.take() {
        let buf = Arc::clone(logs);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.push(line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let buf = Arc::clone(logs);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.push(line);
            }
        });
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::tests::fake_service;

    fn backend(app: PathBuf, config: PathBuf) -> (EmbeddedBackend, Arc<LogBuffer>) {
        let logs = Arc::new(LogBuffer::default());
        (
            EmbeddedBackend::new(app, config, logs.clone(), Duration::from_secs(5)),
            logs,
        )
    }

    #[tokio::test]
    async fn stop_before_start_is_ok() {
        let (backend, _) = backend("/nonexistent".into(), "/nonexistent.yaml".into());
        backend.stop().await.unwrap();
        assert!(!backend.is_running());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = fake_service(dir.path());
        let (backend, logs) = backend(app, dir.path().join("config.yaml"));

        backend.start().await.unwrap();
        assert!(backend.is_running());
        let err = backend.start().await.unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyRunning));

        for _ in 0..40 {
            if !logs.tail(10).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(logs.tail(10), vec!["listening"]);

        backend.stop().await.unwrap();
        assert!(!backend.is_running());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let (backend, _) = backend("/nonexistent/headscale".into(), "/c.yaml".into());
        let err = backend.start().await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(!backend.is_running());
    }

    #[tokio::test]
    async fn crash_is_reported_with_output() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("headscale");
        std::fs::write(&app, "#!/bin/sh\necho \"FTL cannot open database\" >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&app, std::fs::Permissions::from_mode(0o755)).unwrap();
        let (backend, logs) = backend(app, dir.path().join("config.yaml"));

        backend.start().await.unwrap();
        for _ in 0..40 {
            if !backend.is_running() && !logs.tail(1).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(!backend.is_running());
        let reported = backend.exit_error().unwrap();
        assert!(reported.starts_with("service exited with failure"), "{reported}");
        assert_eq!(logs.tail(5), vec!["FTL cannot open database"]);
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let app = fake_service(dir.path());
        let (backend, _) = backend(app, dir.path().join("config.yaml"));

        backend.start().await.unwrap();
        backend.stop().await.unwrap();
        backend.start().await.unwrap();
        assert!(backend.is_running());
        backend.stop().await.unwrap();
    }
}
