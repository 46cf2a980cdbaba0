//! On-disk session records.
//!
//! Every session owns a directory `<project>/.fleet/sessions/<id>/` holding
//! three independently JSON-encoded files:
//! - `daemon.json` — identity, written once by the worker at startup
//! - `state.json` — progress, overwritten by the worker every iteration
//! - `control.json` — at most one pending command (see [`crate::control`])
//!
//! Writes go to a uniquely named sibling temp file and are renamed into
//! place, so readers see either the previous or the new document. There is
//! no locking beyond that: identity and state are last-writer-wins.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::error::RecordError;

/// Well-known record locations.
pub mod paths {
    /// Hidden per-project directory.
    pub const FLEET_DIR: &str = ".fleet";
    /// Parent of all session directories, relative to [`FLEET_DIR`].
    pub const SESSIONS_DIR: &str = "sessions";
    pub const IDENTITY_FILE: &str = "daemon.json";
    pub const STATE_FILE: &str = "state.json";
    pub const CONTROL_FILE: &str = "control.json";
    /// Suffix appended to the control path by a reader claiming it.
    pub const CLAIM_SUFFIX: &str = ".claimed";
    pub const LOG_FILE: &str = "loop.log";
    pub const TRANSCRIPT_FILE: &str = "transcript.log";
}

/// Session id reserved for the aggregate "all sessions" view. Never a worker.
pub const AGGREGATE_SESSION: &str = "_all";

/// Directory holding every session of a project.
pub fn sessions_root(project: &Path) -> PathBuf {
    project.join(paths::FLEET_DIR).join(paths::SESSIONS_DIR)
}

/// Addressing unit for session records: (project root, session id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub project: PathBuf,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(project: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            session_id: session_id.into(),
        }
    }

    /// Whether this key names the aggregate view rather than a real session.
    pub fn is_aggregate(&self) -> bool {
        self.session_id == AGGREGATE_SESSION
    }

    pub fn dir(&self) -> PathBuf {
        sessions_root(&self.project).join(&self.session_id)
    }

    pub fn identity_path(&self) -> PathBuf {
        self.dir().join(paths::IDENTITY_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir().join(paths::STATE_FILE)
    }

    pub fn control_path(&self) -> PathBuf {
        self.dir().join(paths::CONTROL_FILE)
    }

    pub fn claimed_control_path(&self) -> PathBuf {
        self.dir()
            .join(format!("{}{}", paths::CONTROL_FILE, paths::CLAIM_SUFFIX))
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir().join(paths::LOG_FILE)
    }

    pub fn transcript_path(&self) -> PathBuf {
        self.dir().join(paths::TRANSCRIPT_FILE)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project.display(), self.session_id)
    }
}

/// Identity of the worker process owning a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub pid: u32,
    pub session_id: String,
    pub project_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub max_iterations: u32,
    pub model: String,
    #[serde(default)]
    pub provider: String,
}

/// Progress snapshot published by a running worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateRecord {
    pub running: bool,
    pub paused: bool,
    pub current_item_id: String,
    pub current_item_title: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub files_changed: u32,
    pub criteria_complete: u32,
    pub criteria_total: u32,
    pub model: String,
    pub provider: String,
    /// Refreshed on every write; the only stall signal.
    pub last_updated: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl StateRecord {
    /// Whether `last_updated` was ever stamped.
    pub fn has_heartbeat(&self) -> bool {
        self.last_updated != DateTime::<Utc>::UNIX_EPOCH
    }
}

/// Serialize `value` into `path` through a temp file + rename.
pub(crate) async fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), RecordError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| RecordError::io(parent, e))?;
    }

    let body = serde_json::to_vec_pretty(value).map_err(|source| RecordError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    fs::write(&temp_path, &body)
        .await
        .map_err(|e| RecordError::io(&temp_path, e))?;
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(RecordError::io(path, e));
    }
    Ok(())
}

/// Read and deserialize `path`. A missing file is `Ok(None)`.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, RecordError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RecordError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| RecordError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Delete `path`. A missing file counts as success.
pub(crate) async fn remove_if_exists(path: &Path) -> Result<(), RecordError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RecordError::io(path, e)),
    }
}

/// Reads and writes the identity/state/control records of one session.
#[derive(Debug, Clone)]
pub struct RecordStore {
    key: SessionKey,
}

impl RecordStore {
    pub fn new(key: SessionKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub async fn write_identity(&self, info: &IdentityRecord) -> Result<(), RecordError> {
        write_json_atomic(&self.key.identity_path(), info).await
    }

    pub async fn read_identity(&self) -> Result<Option<IdentityRecord>, RecordError> {
        read_json(&self.key.identity_path()).await
    }

    pub async fn remove_identity(&self) -> Result<(), RecordError> {
        remove_if_exists(&self.key.identity_path()).await
    }

    /// Stamp `last_updated = now` and overwrite the state record.
    pub async fn write_state(&self, state: &mut StateRecord) -> Result<(), RecordError> {
        state.last_updated = Utc::now();
        write_json_atomic(&self.key.state_path(), state).await
    }

    pub async fn read_state(&self) -> Result<Option<StateRecord>, RecordError> {
        read_json(&self.key.state_path()).await
    }

    pub async fn remove_state(&self) -> Result<(), RecordError> {
        remove_if_exists(&self.key.state_path()).await
    }

    /// Best-effort delete of the identity and state records.
    ///
    /// A pending control command is kept for whichever worker starts next.
    pub async fn remove_worker_records(&self) -> Result<(), RecordError> {
        self.remove_each([self.key.identity_path(), self.key.state_path()])
            .await
    }

    /// Best-effort delete of all three records.
    ///
    /// Every delete is attempted; the first failure is returned.
    pub async fn remove_all(&self) -> Result<(), RecordError> {
        self.remove_each([
            self.key.identity_path(),
            self.key.state_path(),
            self.key.control_path(),
        ])
        .await
    }

    async fn remove_each<const N: usize>(&self, paths: [PathBuf; N]) -> Result<(), RecordError> {
        let mut first_err = None;
        for path in paths {
            if let Err(e) = remove_if_exists(&path).await {
                tracing::warn!(session = %self.key, error = %e, "Failed to remove record");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
