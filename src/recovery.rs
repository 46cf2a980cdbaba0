//! Recovery of commands a stalled worker never executed.
//!
//! Runs before the supervisor restarts a stalled worker. Every
//! implementation is best-effort: failures are logged and swallowed, and the
//! supervisor behaves correctly even when recovery does nothing.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::fs;
use tokio::process::Command;

use crate::control::{self, ControlCommand};
use crate::records::SessionKey;

/// Only the tail of a transcript is scanned.
const TRANSCRIPT_TAIL_LINES: usize = 200;

/// Command lines as the CLI prints them:
/// `fleet-loop send <project> <session> <command> [arg]`.
static SEND_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"fleet-loop\s+send\s+\S+\s+(?P<session>[^\s"'\\]+)\s+(?P<command>pause|resume|cancel|skip_ball|change_model)\b(?:[ \t]+(?P<arg>[^\s"'\\]+))?"#,
    )
    .expect("valid regex")
});

/// Replays a missed command for a session.
#[async_trait]
pub trait RecoveryBridge: Send + Sync {
    /// Best-effort; must not fail and must return in bounded time.
    async fn recover(&self, key: &SessionKey);
}

/// Does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecovery;

#[async_trait]
impl RecoveryBridge for NoopRecovery {
    async fn recover(&self, _key: &SessionKey) {}
}

/// Scans the session transcript for the last command line addressed to
/// this session and re-sends it when the mailbox is empty.
#[derive(Debug, Clone)]
pub struct TranscriptRecovery {
    timeout: Duration,
}

impl TranscriptRecovery {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn replay(&self, key: &SessionKey) -> Option<(ControlCommand, String)> {
        if control::is_pending(key).await {
            tracing::debug!(session = %key, "Command already pending, nothing to recover");
            return None;
        }
        let transcript = fs::read_to_string(key.transcript_path()).await.ok()?;
        let (command, arg) = last_command(&transcript, &key.session_id)?;

        match control::send(key, command, arg.clone()).await {
            Ok(_) => Some((command, arg)),
            Err(e) => {
                tracing::warn!(session = %key, error = %e, "Failed to replay recovered command");
                None
            }
        }
    }
}

#[async_trait]
impl RecoveryBridge for TranscriptRecovery {
    async fn recover(&self, key: &SessionKey) {
        match tokio::time::timeout(self.timeout, self.replay(key)).await {
            Ok(Some((command, arg))) => {
                tracing::info!(session = %key, command = %command, arg = %arg, "Recovered missed command");
            }
            Ok(None) => {}
            Err(_) => {
                tracing::warn!(session = %key, timeout = ?self.timeout, "Transcript recovery timed out");
            }
        }
    }
}

/// Last command-like line for `session_id` in the tail of `transcript`.
pub fn last_command(transcript: &str, session_id: &str) -> Option<(ControlCommand, String)> {
    let lines: Vec<&str> = transcript.lines().collect();
    let tail = &lines[lines.len().saturating_sub(TRANSCRIPT_TAIL_LINES)..];

    tail.iter()
        .rev()
        .copied()
        .flat_map(|line| {
            let mut caps: Vec<_> = SEND_LINE.captures_iter(line).collect();
            caps.reverse();
            caps
        })
        .filter(|caps| &caps["session"] == session_id)
        .find_map(|caps| {
            let command: ControlCommand = caps["command"].parse().ok()?;
            let arg = caps
                .name("arg")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            if command.requires_argument() && arg.is_empty() {
                return None;
            }
            Some((command, arg))
        })
}

/// Runs an external hook `<cmd> <project> <session>` with a timeout.
#[derive(Debug, Clone)]
pub struct CommandRecovery {
    program: String,
    timeout: Duration,
}

impl CommandRecovery {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn command(&self, project: &Path, session_id: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(project)
            .arg(session_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RecoveryBridge for CommandRecovery {
    async fn recover(&self, key: &SessionKey) {
        let mut cmd = self.command(&key.project, &key.session_id);
        match tokio::time::timeout(self.timeout, cmd.status()).await {
            Ok(Ok(status)) if status.success() => {
                tracing::info!(session = %key, hook = %self.program, "Recovery hook finished");
            }
            Ok(Ok(status)) => {
                tracing::warn!(session = %key, hook = %self.program, %status, "Recovery hook failed");
            }
            Ok(Err(e)) => {
                tracing::warn!(session = %key, hook = %self.program, error = %e, "Recovery hook did not start");
            }
            Err(_) => {
                tracing::warn!(session = %key, hook = %self.program, timeout = ?self.timeout, "Recovery hook timed out");
            }
        }
    }
}
