//! Starting and stopping worker processes.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{DEFAULT_WORKER_BIN, WorkerCommand};
use crate::error::LaunchError;
use crate::records::SessionKey;

/// Starts detached workers and terminates stale ones.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start a worker for `key` and return its pid.
    async fn launch(&self, key: &SessionKey) -> Result<u32, LaunchError>;

    /// Ask a worker process to exit. An already-gone process is success.
    fn terminate(&self, pid: u32) -> Result<(), LaunchError>;
}

/// Spawns real OS processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: WorkerCommand,
    settle_delay: Duration,
}

impl ProcessLauncher {
    pub fn new(command: WorkerCommand, settle_delay: Duration) -> Self {
        Self {
            command,
            settle_delay,
        }
    }

    /// Resolve the worker executable.
    ///
    /// An explicit program is used as-is when it contains a path separator,
    /// otherwise looked up on `PATH`. Without one, [`DEFAULT_WORKER_BIN`] is
    /// looked for next to the current executable, then on `PATH`.
    pub fn locate_executable(&self) -> Result<PathBuf, LaunchError> {
        if let Some(program) = &self.command.program {
            if program.components().count() > 1 {
                return if program.is_file() {
                    Ok(program.clone())
                } else {
                    Err(LaunchError::ExecutableNotFound(program.display().to_string()))
                };
            }
            return search_path(program)
                .ok_or_else(|| LaunchError::ExecutableNotFound(program.display().to_string()));
        }

        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_WORKER_BIN)))
            .filter(|path| path.is_file());
        sibling
            .or_else(|| search_path(Path::new(DEFAULT_WORKER_BIN)))
            .ok_or_else(|| LaunchError::ExecutableNotFound(DEFAULT_WORKER_BIN.to_string()))
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, key: &SessionKey) -> Result<u32, LaunchError> {
        let program = self.locate_executable()?;
        let log_path = key.log_path();

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LaunchError::LogFile {
                path: log_path.clone(),
                source,
            })?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|source| LaunchError::LogFile {
                path: log_path.clone(),
                source,
            })?;
        let log_err = log.try_clone().map_err(|source| LaunchError::LogFile {
            path: log_path.clone(),
            source,
        })?;

        let mut cmd = Command::new(&program);
        cmd.args(self.command.render_args(&key.session_id, &key.project))
            .current_dir(&key.project)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        // Reap in the background so the child never lingers as a zombie.
        let session = key.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(session = %session, pid, %status, "Worker exited"),
                Err(e) => tracing::warn!(session = %session, pid, error = %e, "Failed to reap worker"),
            }
        });

        tracing::info!(
            session = %key,
            pid,
            program = %program.display(),
            log = %log_path.display(),
            "Worker launched"
        );

        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> Result<(), LaunchError> {
        terminate_process(pid)
    }
}

/// Send SIGTERM to `pid`. "No such process" counts as success.
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> Result<(), LaunchError> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw_pid = i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| LaunchError::Signal {
            pid,
            reason: "pid out of range".to_string(),
        })?;

    match kill(Pid::from_raw(raw_pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(LaunchError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
pub fn terminate_process(pid: u32) -> Result<(), LaunchError> {
    Err(LaunchError::Signal {
        pid,
        reason: "signals unsupported on this platform".to_string(),
    })
}

fn search_path(program: &Path) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
