//! Configuration types.
//!
//! Everything is read from the environment; unset keys fall back to the
//! defaults below.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Directory under `$HOME` used when `FLEET_HOME` is unset.
const DEFAULT_HOME_DIR: &str = ".fleet";

/// Default worker arguments; `{session}` and `{project}` are substituted.
const DEFAULT_WORKER_ARGS: &str = "loop --session {session}";

/// Default worker executable name, looked up next to our own binary first.
pub const DEFAULT_WORKER_BIN: &str = "fleet-worker";

/// Supervisor policy configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between poll cycles.
    pub poll_interval: Duration,
    /// A running worker silent for longer than this is stalled.
    pub stall_timeout: Duration,
    /// Cap on concurrently running workers across all projects.
    pub max_concurrent: usize,
    /// Kill and relaunch stalled workers.
    pub auto_restart: bool,
    /// Launch workers for idle sessions that have work.
    pub auto_launch: bool,
    /// Pause after each launch so the new worker can register.
    pub settle_delay: Duration,
    /// Upper bound on a single recovery attempt.
    pub recovery_timeout: Duration,
    /// Known project roots, in discovery order.
    pub projects: Vec<PathBuf>,
    /// Where the supervisor keeps its own record and logs.
    pub home: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5 * 60),
            stall_timeout: Duration::from_secs(10 * 60),
            max_concurrent: 3,
            auto_restart: true,
            auto_launch: false,
            settle_delay: Duration::from_millis(2000),
            recovery_timeout: Duration::from_secs(30),
            projects: Vec::new(),
            home: PathBuf::from(DEFAULT_HOME_DIR),
        }
    }
}

impl SupervisorConfig {
    /// Load from process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let poll_minutes = parse_u64(&lookup, "FLEET_POLL_INTERVAL_MIN", 5)?;
        if poll_minutes == 0 {
            return Err(invalid("FLEET_POLL_INTERVAL_MIN", "must be at least 1"));
        }
        let stall_minutes = parse_u64(&lookup, "FLEET_STALL_TIMEOUT_MIN", 10)?;
        if stall_minutes == 0 {
            return Err(invalid("FLEET_STALL_TIMEOUT_MIN", "must be at least 1"));
        }
        let max_concurrent = parse_u64(&lookup, "FLEET_MAX_CONCURRENT", 3)? as usize;
        if max_concurrent == 0 {
            return Err(invalid("FLEET_MAX_CONCURRENT", "must be at least 1"));
        }
        let settle_ms = parse_u64(&lookup, "FLEET_SETTLE_MS", 2000)?;

        let projects = lookup("FLEET_PROJECTS")
            .map(|raw| std::env::split_paths(&raw).filter(|p| !p.as_os_str().is_empty()).collect())
            .unwrap_or_default();

        Ok(Self {
            poll_interval: minutes(poll_minutes, "FLEET_POLL_INTERVAL_MIN")?,
            stall_timeout: minutes(stall_minutes, "FLEET_STALL_TIMEOUT_MIN")?,
            max_concurrent,
            auto_restart: parse_bool(&lookup, "FLEET_AUTO_RESTART", defaults.auto_restart)?,
            auto_launch: parse_bool(&lookup, "FLEET_AUTO_LAUNCH", defaults.auto_launch)?,
            settle_delay: Duration::from_millis(settle_ms),
            recovery_timeout: defaults.recovery_timeout,
            projects,
            home: fleet_home(&lookup)?,
        })
    }

    /// Path of the supervisor's own liveness record.
    pub fn supervisor_record_path(&self) -> PathBuf {
        self.home.join("supervisor.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }
}

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Explicit executable; `None` means locate [`DEFAULT_WORKER_BIN`].
    pub program: Option<PathBuf>,
    /// Argument template.
    pub args: Vec<String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: None,
            args: split_args(DEFAULT_WORKER_ARGS),
        }
    }
}

impl WorkerCommand {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let program = lookup("FLEET_WORKER_BIN")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        let args = lookup("FLEET_WORKER_ARGS")
            .map(|raw| split_args(&raw))
            .unwrap_or_else(|| split_args(DEFAULT_WORKER_ARGS));
        Self { program, args }
    }

    /// Arguments with placeholders filled in.
    pub fn render_args(&self, session_id: &str, project: &std::path::Path) -> Vec<String> {
        let project = project.display().to_string();
        self.args
            .iter()
            .map(|a| a.replace("{session}", session_id).replace("{project}", &project))
            .collect()
    }
}

/// Optional external recovery hook (`FLEET_RECOVERY_CMD`).
pub fn recovery_command_from_env() -> Option<String> {
    std::env::var("FLEET_RECOVERY_CMD")
        .ok()
        .filter(|s| !s.trim().is_empty())
}

/// Resolve the fleet home: `FLEET_HOME`, else `$HOME/.fleet`.
fn fleet_home<F>(lookup: &F) -> Result<PathBuf, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(home) = lookup("FLEET_HOME").filter(|s| !s.trim().is_empty()) {
        return Ok(PathBuf::from(home));
    }
    lookup("HOME")
        .filter(|s| !s.trim().is_empty())
        .map(|home| PathBuf::from(home).join(DEFAULT_HOME_DIR))
        .ok_or(ConfigError::MissingHome)
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn minutes(value: u64, key: &str) -> Result<Duration, ConfigError> {
    value
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| invalid(key, "too large"))
}

fn parse_u64<F>(lookup: &F, key: &str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| invalid(key, format!("{raw:?}: {e}"))),
    }
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, format!("{raw:?} is not a boolean"))),
    }
}
