// SPDX-License-Identifier: MIT OR Apache-2.0
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Errors raised while spawning or waiting on a supervised process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be spawned.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        /// Command that failed to spawn.
        command: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The process did not terminate within the shutdown grace period.
    #[error("process did not exit within {0:?}")]
    ShutdownTimeout(std::time::Duration),
}

/// A command to run, with its working directory and environment.
#[derive(Clone, Debug)]
pub struct ProcessSpec {
    /// Executable path or name (resolved via `PATH` if not absolute).
    pub command: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Environment variables set for the process, merged over the
    /// supervisor's own environment.
    pub env: BTreeMap<String, String>,
    /// Working directory, if not the supervisor's own.
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    /// Build a spec with no args/env overrides.
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }
}

/// A running (or exited) child process under supervision.
pub struct SupervisedProcess {
    child: Child,
    pub pid: Option<u32>,
}

impl SupervisedProcess {
    /// Spawn `spec`, inheriting stdout/stderr for log visibility and
    /// closing stdin.
    pub fn spawn(spec: &ProcessSpec) -> Result<Self, ProcessError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: spec.command.display().to_string(),
            source,
        })?;
        let pid = child.id();
        info!(command = %spec.command.display(), ?pid, "spawned supervised process");
        Ok(Self { child, pid })
    }

    /// Non-blocking check for exit. Returns `Some(code)` once exited.
    pub fn try_wait(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "error polling child status");
                None
            }
        }
    }

    /// Send a graceful termination signal, then escalate to kill if the
    /// process has not exited within `grace`.
    pub async fn stop(&mut self, grace: std::time::Duration) -> Result<(), ProcessError> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                send_sigterm(pid);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if let Ok(Some(_)) = self.child.try_wait() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                debug!("grace period elapsed, escalating to kill");
                let _ = self.child.kill().await;
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // tokio::process::Child only exposes SIGKILL; shell out for SIGTERM.
    let _ = std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status();
}
