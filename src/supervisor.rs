//! Fleet supervisor: discover sessions, detect stalls, restart or launch.
//!
//! One poll cycle is fully sequential:
//! 1. discover every session of every known project
//! 2. build a fresh [`SessionStatus`] per session (liveness, stall, counts)
//! 3. act on each session in discovery order under a global worker cap
//!
//! Cycles never overlap. A stop request is only observed between cycles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::discovery;
use crate::error::{RecordError, SupervisorError};
use crate::items::{ItemCounts, WorkItem, WorkItemSource};
use crate::launcher::Launcher;
use crate::liveness::{self, Liveness};
use crate::records::{self, RecordStore, SessionKey, StateRecord};
use crate::recovery::RecoveryBridge;

/// Status text marking a stalled worker.
pub const STALLED: &str = "STALLED";
/// Status text for a worker whose state claimed it was running after it died.
pub const EXITED_UNEXPECTEDLY: &str = "exited unexpectedly";

/// Point-in-time view of one session. Rebuilt every cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub key: SessionKey,
    pub counts: ItemCounts,
    pub running: bool,
    pub stalled: bool,
    pub pid: Option<u32>,
    pub status: String,
    /// Set when the session's records could not be read; such sessions are
    /// left alone this cycle.
    pub error: Option<String>,
}

/// Whether a running worker's state is older than `timeout`.
///
/// Exclusive bound: exactly `timeout` old is not stalled. A state that was
/// never stamped is not stalled either.
pub fn is_stalled(state: &StateRecord, now: DateTime<Utc>, timeout: Duration) -> bool {
    if !state.has_heartbeat() {
        return false;
    }
    let Ok(limit) = chrono::Duration::from_std(timeout) else {
        return false;
    };
    now.signed_duration_since(state.last_updated) > limit
}

/// Global cap on concurrently running workers within one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    cap: usize,
    active: usize,
    launched: usize,
}

impl Admission {
    /// Healthy workers (running and not stalled) count against the cap,
    /// including live workers whose records could not be read.
    pub fn new(cap: usize, statuses: &[SessionStatus]) -> Self {
        let active = statuses.iter().filter(|s| s.running && !s.stalled).count();
        Self {
            cap,
            active,
            launched: 0,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.active + self.launched < self.cap
    }

    pub fn record_launch(&mut self) {
        self.launched += 1;
    }

    pub fn launched(&self) -> usize {
        self.launched
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub sessions: usize,
    pub restarted: Vec<SessionKey>,
    pub launched: Vec<SessionKey>,
    /// Eligible but over the cap; retried next cycle.
    pub deferred: Vec<SessionKey>,
    pub failures: usize,
}

/// External collaborators of the supervisor.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub launcher: Arc<dyn Launcher>,
    pub liveness: Arc<dyn Liveness>,
    pub recovery: Arc<dyn RecoveryBridge>,
    pub items: Arc<dyn WorkItemSource>,
}

/// The supervisor's own liveness record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Read the supervisor record; a record naming a dead pid is removed.
pub async fn supervisor_status(
    path: &Path,
    probe: &dyn Liveness,
) -> Result<Option<SupervisorRecord>, RecordError> {
    let Some(record) = records::read_json::<SupervisorRecord>(path).await? else {
        return Ok(None);
    };
    if probe.is_alive(record.pid) {
        return Ok(Some(record));
    }
    info!(pid = record.pid, "Removing stale supervisor record");
    records::remove_if_exists(path).await?;
    Ok(None)
}

/// Claim the supervisor record for this process.
async fn register_supervisor(
    path: &Path,
    probe: &dyn Liveness,
) -> Result<SupervisorRecord, SupervisorError> {
    let own_pid = std::process::id();
    match supervisor_status(path, probe).await {
        Ok(Some(existing)) if existing.pid != own_pid => {
            return Err(SupervisorError::AlreadyRunning { pid: existing.pid });
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Ignoring unreadable supervisor record"),
    }

    let record = SupervisorRecord {
        pid: own_pid,
        started_at: Utc::now(),
    };
    records::write_json_atomic(path, &record)
        .await
        .map_err(SupervisorError::Startup)?;
    Ok(record)
}

/// Handle to a running supervisor loop.
pub struct SupervisorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    record: SupervisorRecord,
}

impl SupervisorHandle {
    pub fn record(&self) -> &SupervisorRecord {
        &self.record
    }

    /// Request a stop and wait for the loop to finish its current cycle and
    /// remove the supervisor record.
    pub async fn stop(self) -> Result<(), SupervisorError> {
        let _ = self.stop_tx.send(true);
        self.task
            .await
            .map_err(|e| SupervisorError::Join(e.to_string()))
    }
}

/// Monitors every session of every known project.
pub struct Supervisor {
    config: SupervisorConfig,
    deps: SupervisorDeps,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, deps: SupervisorDeps) -> Self {
        Self { config, deps }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Register this process and start polling in the background.
    ///
    /// The first cycle runs immediately. Failure to write the supervisor
    /// record aborts startup.
    pub async fn start(self) -> Result<SupervisorHandle, SupervisorError> {
        let record_path = self.config.supervisor_record_path();
        let record = register_supervisor(&record_path, self.deps.liveness.as_ref()).await?;
        info!(
            pid = record.pid,
            projects = self.config.projects.len(),
            interval_secs = self.config.poll_interval.as_secs(),
            max_concurrent = self.config.max_concurrent,
            "Supervisor started"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            self.run(stop_rx).await;
            if let Err(e) = records::remove_if_exists(&record_path).await {
                warn!(error = %e, "Failed to remove supervisor record");
            }
            info!("Supervisor stopped");
        });

        Ok(SupervisorHandle {
            stop_tx,
            task,
            record,
        })
    }

    async fn run(&self, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // First tick fires immediately
        loop {
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {
                    let report = self.poll_once().await;
                    info!(
                        sessions = report.sessions,
                        restarted = report.restarted.len(),
                        launched = report.launched.len(),
                        deferred = report.deferred.len(),
                        failures = report.failures,
                        "Poll cycle complete"
                    );
                }
            }
        }
    }

    /// One full discover → snapshot → act cycle.
    pub async fn poll_once(&self) -> CycleReport {
        let statuses = self.snapshot().await;
        self.act(&statuses).await
    }

    /// Build the status of every discovered session as of now.
    pub async fn snapshot(&self) -> Vec<SessionStatus> {
        self.snapshot_at(Utc::now()).await
    }

    /// Build the status of every discovered session as of `now`.
    ///
    /// Side effects are limited to self-healing: stale identities are
    /// reclaimed and a state record still claiming `running` for a dead
    /// worker is corrected.
    pub async fn snapshot_at(&self, now: DateTime<Utc>) -> Vec<SessionStatus> {
        let keys = discovery::discover_sessions(&self.config.projects).await;
        let mut items_by_project: HashMap<PathBuf, Vec<WorkItem>> = HashMap::new();
        let mut statuses = Vec::with_capacity(keys.len());

        for key in keys {
            if !items_by_project.contains_key(&key.project) {
                let items = match self.deps.items.load(&key.project).await {
                    Ok(items) => items,
                    Err(e) => {
                        warn!(project = %key.project.display(), error = %e, "Failed to load work items");
                        Vec::new()
                    }
                };
                items_by_project.insert(key.project.clone(), items);
            }
            let counts = items_by_project
                .get(&key.project)
                .map(|items| ItemCounts::for_session(items, &key.session_id))
                .unwrap_or_default();

            let status = match self.session_status(&key, counts, now).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(session = %key, error = %e, "Failed to read session records");
                    SessionStatus {
                        key,
                        counts,
                        running: false,
                        stalled: false,
                        pid: None,
                        status: format!("error: {e}"),
                        error: Some(e.to_string()),
                    }
                }
            };
            statuses.push(status);
        }
        statuses
    }

    async fn session_status(
        &self,
        key: &SessionKey,
        counts: ItemCounts,
        now: DateTime<Utc>,
    ) -> Result<SessionStatus, RecordError> {
        let store = RecordStore::new(key.clone());
        let identity = liveness::check_running(&store, self.deps.liveness.as_ref()).await?;
        let state = match (store.read_state().await, &identity) {
            (Ok(state), _) => state,
            // A live worker still occupies a slot even when its state is unreadable.
            (Err(e), Some(identity)) => {
                warn!(session = %key, pid = identity.pid, error = %e, "Live worker has unreadable state");
                return Ok(SessionStatus {
                    key: key.clone(),
                    counts,
                    running: true,
                    stalled: false,
                    pid: Some(identity.pid),
                    status: format!("running (state unreadable: {e})"),
                    error: Some(e.to_string()),
                });
            }
            (Err(e), None) => return Err(e),
        };

        let mut status = SessionStatus {
            key: key.clone(),
            counts,
            running: identity.is_some(),
            stalled: false,
            pid: identity.as_ref().map(|i| i.pid),
            status: String::new(),
            error: None,
        };

        match (identity, state) {
            (Some(_), Some(state)) => {
                status.stalled = is_stalled(&state, now, self.config.stall_timeout);
                status.status = if status.stalled {
                    let silent = now.signed_duration_since(state.last_updated);
                    format!("{STALLED} (no update for {}m)", silent.num_minutes())
                } else {
                    describe_running(&state)
                };
            }
            (Some(_), None) => {
                status.status = "running (no state yet)".to_string();
            }
            (None, Some(mut state)) if state.running => {
                debug!(session = %key, "Correcting state of dead worker");
                state.running = false;
                state.paused = false;
                store.write_state(&mut state).await?;
                status.status = EXITED_UNEXPECTEDLY.to_string();
            }
            (None, _) => {
                status.status = "not running".to_string();
            }
        }
        Ok(status)
    }

    /// Apply restart/launch policy to a snapshot, in order.
    pub async fn act(&self, statuses: &[SessionStatus]) -> CycleReport {
        let mut admission = Admission::new(self.config.max_concurrent, statuses);
        let mut report = CycleReport {
            sessions: statuses.len(),
            ..Default::default()
        };

        for status in statuses {
            if status.error.is_some() {
                continue;
            }
            if status.stalled && self.config.auto_restart {
                self.restart(status, &mut admission, &mut report).await;
            } else if self.config.auto_launch && !status.running && status.counts.has_open_work() {
                self.launch_if_admitted(&status.key, &mut admission, &mut report)
                    .await;
            }
        }
        report
    }

    async fn restart(
        &self,
        status: &SessionStatus,
        admission: &mut Admission,
        report: &mut CycleReport,
    ) {
        let key = &status.key;
        warn!(session = %key, pid = ?status.pid, status = %status.status, "Restarting stalled worker");

        if tokio::time::timeout(self.config.recovery_timeout, self.deps.recovery.recover(key))
            .await
            .is_err()
        {
            warn!(session = %key, "Recovery did not finish in time");
        }

        if let Some(pid) = status.pid
            && let Err(e) = self.deps.launcher.terminate(pid)
        {
            error!(session = %key, pid, error = %e, "Failed to terminate stalled worker");
            report.failures += 1;
        }

        // Keep control.json: recovery may have queued a command for the replacement.
        if let Err(e) = RecordStore::new(key.clone()).remove_worker_records().await {
            error!(session = %key, error = %e, "Failed to remove records of stalled worker");
            report.failures += 1;
        }

        if self.launch_if_admitted(key, admission, report).await {
            report.restarted.push(key.clone());
        }
    }

    /// Launch a worker when under the cap. Returns whether one started.
    async fn launch_if_admitted(
        &self,
        key: &SessionKey,
        admission: &mut Admission,
        report: &mut CycleReport,
    ) -> bool {
        if !admission.has_capacity() {
            info!(session = %key, cap = self.config.max_concurrent, "At worker cap, deferring launch");
            report.deferred.push(key.clone());
            return false;
        }
        match self.deps.launcher.launch(key).await {
            Ok(pid) => {
                admission.record_launch();
                report.launched.push(key.clone());
                info!(session = %key, pid, "Launched worker");
                true
            }
            Err(e) => {
                error!(session = %key, error = %e, "Failed to launch worker");
                report.failures += 1;
                false
            }
        }
    }
}

fn describe_running(state: &StateRecord) -> String {
    let mode = if state.paused { "paused" } else { "running" };
    let mut text = format!("{mode} (iteration {}/{})", state.iteration, state.max_iterations);
    if !state.current_item_id.is_empty() {
        text.push_str(&format!(" on {}", state.current_item_id));
    }
    text
}
