//! Error types for fleet-loop.

use std::path::PathBuf;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Cannot determine home directory (set HOME or FLEET_HOME)")]
    MissingHome,
}

/// Errors reading or writing on-disk session records.
///
/// A missing record is not an error; readers return `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl RecordError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Control channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Unknown control command: {0}")]
    UnknownCommand(String),

    #[error("Control command {0} requires an argument")]
    MissingArgument(String),

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Worker lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Worker in state {from} cannot handle {command}")]
    InvalidTransition { from: String, command: String },

    #[error("Worker failed to register identity: {0}")]
    Startup(#[source] RecordError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Worker launch and termination errors.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Worker executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Failed to open worker log {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

/// Supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Supervisor already running with pid {pid}")]
    AlreadyRunning { pid: u32 },

    #[error("Supervisor failed to register itself: {0}")]
    Startup(#[source] RecordError),

    #[error("Work items for {project} unreadable: {reason}")]
    WorkItems { project: PathBuf, reason: String },

    #[error("Supervisor task failed: {0}")]
    Join(String),
}

