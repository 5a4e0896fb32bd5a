//! # Process Handle
//!
//! Wraps one OS child. A supervisor task owns the `Child`: it waits for the
//! exit, honours kill requests, and publishes the exit on a `watch`
//! channel. Output is forwarded line by line into the role's log file and a
//! redacted in-memory tail.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::domain::{redact, LogTail, ProcessRole};
use crate::ports::LaunchSpec;

const STDOUT_TAG: &str = "stdout";
const STDERR_TAG: &str = "stderr";

/// Errors from spawning a process.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} pipe missing")]
    MissingPipe(&'static str),
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub detail: String,
}

/// A running (or exited) child process.
pub struct ProcessHandle {
    role: ProcessRole,
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitInfo>>,
    kill: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
    tail: Arc<LogTail>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("role", &self.role)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Spawn the process described by `spec`.
    pub async fn spawn(spec: &LaunchSpec) -> Result<Self, SpawnError> {
        prepare_dir(&spec.working_dir).await?;
        if let Some(parent) = spec.log_path.parent() {
            prepare_dir(parent).await?;
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            role = %spec.role,
            program = %spec.program.display(),
            args = ?spec.args,
            "spawning process"
        );

        let mut child = command.spawn().map_err(|source| SpawnError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe(STDOUT_TAG))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SpawnError::MissingPipe(STDERR_TAG))?;

        let tail = Arc::new(LogTail::default());
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        spawn_stream_forwarder(stdout, line_tx.clone(), STDOUT_TAG);
        spawn_stream_forwarder(stderr, line_tx, STDERR_TAG);
        tokio::spawn(write_log(
            spec.log_path.clone(),
            line_rx,
            tail.clone(),
            spec.role,
        ));

        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(child, spec.role, exit_tx, kill_rx));

        debug!(role = %spec.role, pid = ?pid, "process spawned");
        Ok(Self {
            role: spec.role,
            pid,
            exit: exit_rx,
            kill: Some(kill_tx),
            supervisor,
            tail,
        })
    }

    #[must_use]
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit notification; `Some` once the process has ended.
    #[must_use]
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit.clone()
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Recent redacted output lines.
    #[must_use]
    pub fn tail(&self, lines: usize) -> Vec<String> {
        self.tail.last(lines)
    }

    /// Wait for the exit.
    pub async fn wait(&mut self) -> ExitInfo {
        match self.exit.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or_else(unknown_exit),
            Err(_) => unknown_exit(),
        }
    }

    /// Ask politely (SIGTERM on unix), wait up to `grace`, then kill.
    pub async fn terminate(mut self, grace: Duration) -> ExitInfo {
        if self.has_exited() {
            return self.wait().await;
        }

        if let Err(err) = self.signal_terminate() {
            debug!(role = %self.role, error = %err, "terminate signal failed, killing");
        }

        let exit = match timeout(grace, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(role = %self.role, pid = ?self.pid, "grace period elapsed, killing");
                if let Some(kill) = self.kill.take() {
                    let _ = kill.send(());
                }
                self.wait().await
            }
        };
        info!(role = %self.role, code = ?exit.code, "process stopped");
        exit
    }

    #[cfg(unix)]
    fn signal_terminate(&mut self) -> std::io::Result<()> {
        let pid = self
            .pid
            .and_then(|p| libc::pid_t::try_from(p).ok())
            .ok_or_else(|| std::io::Error::other("process has no pid"))?;
        // SAFETY: plain kill(2) on a pid we spawned and still supervise.
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self) -> std::io::Result<()> {
        match self.kill.take() {
            Some(kill) => {
                let _ = kill.send(());
                Ok(())
            }
            None => Err(std::io::Error::other("kill already requested")),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // The supervisor task owns the child; an abandoned handle kills it.
        if !self.has_exited() {
            if let Some(kill) = self.kill.take() {
                let _ = kill.send(());
            } else {
                self.supervisor.abort();
            }
        }
    }
}

fn unknown_exit() -> ExitInfo {
    ExitInfo {
        code: None,
        detail: "exit status unavailable".to_string(),
    }
}

async fn prepare_dir(path: &Path) -> Result<(), SpawnError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| SpawnError::Prepare {
            path: path.display().to_string(),
            source,
        })
}

async fn supervise(
    mut child: Child,
    role: ProcessRole,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    kill_rx: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        requested = kill_rx => {
            if requested.is_ok() {
                if let Err(err) = child.start_kill() {
                    warn!(role = %role, error = %err, "failed to kill process");
                }
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ExitInfo {
            code: status.code(),
            detail: status.to_string(),
        },
        Err(err) => ExitInfo {
            code: None,
            detail: format!("wait failed: {err}"),
        },
    };
    debug!(role = %role, detail = %exit.detail, "process exited");
    let _ = exit_tx.send(Some(exit));
}

fn spawn_stream_forwarder(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::UnboundedSender<String>,
    tag: &'static str,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if tx.send(format!("[{tag}] {}", redact(&line))).is_err() {
                break;
            }
        }
    });
}

async fn write_log(
    path: std::path::PathBuf,
    mut rx: mpsc::UnboundedReceiver<String>,
    tail: Arc<LogTail>,
    role: ProcessRole,
) {
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(role = %role, path = %path.display(), error = %err, "cannot open log file");
            None
        }
    };

    while let Some(line) = rx.recv().await {
        if let Some(f) = file.as_mut() {
            let written = async {
                f.write_all(line.as_bytes()).await?;
                f.write_all(b"\n").await?;
                f.flush().await
            }
            .await;
            if let Err(err) = written {
                warn!(role = %role, error = %err, "log write failed, keeping tail only");
                file = None;
            }
        }
        tail.push(line);
    }
}
