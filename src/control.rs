//! Single-slot control mailbox from a controller to a worker.
//!
//! `send` places a record at the session's control path, replacing any
//! command not yet consumed. `receive` claims the record by renaming it to a
//! private path; the rename is atomic on one filesystem, so of several
//! concurrent readers exactly one wins and the rest see an empty mailbox.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ControlError, RecordError};
use crate::records::{self, SessionKey};

/// Commands a controller can send to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Pause,
    Resume,
    Cancel,
    /// Abandon the current work item.
    #[serde(rename = "skip_ball")]
    SkipCurrent,
    /// Switch model; the target travels in `args`.
    ChangeModel,
}

impl ControlCommand {
    pub const ALL: [ControlCommand; 5] = [
        Self::Pause,
        Self::Resume,
        Self::Cancel,
        Self::SkipCurrent,
        Self::ChangeModel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::SkipCurrent => "skip_ball",
            Self::ChangeModel => "change_model",
        }
    }

    /// Whether the command is meaningless without an argument.
    pub fn requires_argument(&self) -> bool {
        matches!(self, Self::ChangeModel)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlCommand {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ControlError::UnknownCommand(s.to_string()))
    }
}

/// A pending command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRecord {
    pub command: ControlCommand,
    #[serde(default)]
    pub args: String,
    pub sent_at: DateTime<Utc>,
}

/// Place a command in the session's mailbox (last writer wins).
pub async fn send(
    key: &SessionKey,
    command: ControlCommand,
    args: impl Into<String>,
) -> Result<ControlRecord, ControlError> {
    let args = args.into();
    if command.requires_argument() && args.trim().is_empty() {
        return Err(ControlError::MissingArgument(command.to_string()));
    }

    let path = key.control_path();
    if fs::try_exists(&path).await.unwrap_or(false) {
        tracing::warn!(
            session = %key,
            command = %command,
            "Overwriting unconsumed control command"
        );
    }

    let record = ControlRecord {
        command,
        args,
        sent_at: Utc::now(),
    };
    records::write_json_atomic(&path, &record).await?;
    tracing::debug!(session = %key, command = %command, "Control command sent");
    Ok(record)
}

/// Claim and consume the pending command, if any.
///
/// Returns `Ok(None)` when the mailbox is empty or another reader won the
/// claim. A claimed file is always deleted, even when it fails to parse.
///
/// All readers share one claimed path. If a `send` lands while another
/// reader still holds its claim, a second reader's rename replaces that
/// claimed file and one of the two commands is lost. One reader per session
/// (the worker itself) never hits this window.
pub async fn receive(key: &SessionKey) -> Result<Option<ControlRecord>, ControlError> {
    let path = key.control_path();
    let claimed = key.claimed_control_path();

    match fs::rename(&path, &claimed).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RecordError::io(&path, e).into()),
    }

    let parsed = records::read_json::<ControlRecord>(&claimed).await;
    if let Err(e) = records::remove_if_exists(&claimed).await {
        tracing::warn!(session = %key, error = %e, "Failed to delete claimed control file");
    }

    match parsed {
        Ok(record) => Ok(record),
        Err(e) => {
            tracing::warn!(session = %key, error = %e, "Discarded unreadable control command");
            Err(e.into())
        }
    }
}

/// Whether a command is waiting to be claimed.
pub async fn is_pending(key: &SessionKey) -> bool {
    fs::try_exists(key.control_path()).await.unwrap_or(false)
}
