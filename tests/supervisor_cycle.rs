//! Integration tests for the supervisor poll cycle.
//!
//! Each test lays out real session records in temp project directories and
//! drives whole cycles through fake launcher/liveness/recovery collaborators.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use fleet_loop::config::SupervisorConfig;
use fleet_loop::control::{self, ControlCommand};
use fleet_loop::error::LaunchError;
use fleet_loop::items::JsonlWorkItems;
use fleet_loop::launcher::Launcher;
use fleet_loop::liveness::Liveness;
use fleet_loop::records::{IdentityRecord, RecordStore, SessionKey, StateRecord};
use fleet_loop::recovery::{RecoveryBridge, TranscriptRecovery};
use fleet_loop::supervisor::{
    EXITED_UNEXPECTEDLY, STALLED, Supervisor, SupervisorDeps, supervisor_status,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Pids reported alive; everything else is dead.
#[derive(Default)]
struct FakeLiveness {
    alive: Mutex<HashSet<u32>>,
}

impl FakeLiveness {
    fn with_alive(pids: &[u32]) -> Self {
        Self {
            alive: Mutex::new(pids.iter().copied().collect()),
        }
    }
}

impl Liveness for FakeLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        // The supervisor's own record must look alive.
        pid == std::process::id() || self.alive.lock().unwrap().contains(&pid)
    }
}

/// Records launches and terminations instead of touching processes.
#[derive(Default)]
struct FakeLauncher {
    launched: Mutex<Vec<SessionKey>>,
    terminated: Mutex<Vec<u32>>,
    fail_for: Mutex<HashSet<String>>,
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, key: &SessionKey) -> Result<u32, LaunchError> {
        if self.fail_for.lock().unwrap().contains(&key.session_id) {
            return Err(LaunchError::ExecutableNotFound("fake".to_string()));
        }
        let mut launched = self.launched.lock().unwrap();
        launched.push(key.clone());
        Ok(50_000 + launched.len() as u32)
    }

    fn terminate(&self, pid: u32) -> Result<(), LaunchError> {
        self.terminated.lock().unwrap().push(pid);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingRecovery {
    calls: Mutex<Vec<SessionKey>>,
}

#[async_trait]
impl RecoveryBridge for RecordingRecovery {
    async fn recover(&self, key: &SessionKey) {
        self.calls.lock().unwrap().push(key.clone());
    }
}

struct Harness {
    project: TempDir,
    home: TempDir,
    launcher: Arc<FakeLauncher>,
    liveness: Arc<FakeLiveness>,
    recovery: Arc<RecordingRecovery>,
}

impl Harness {
    fn new(alive: &[u32]) -> Self {
        Self {
            project: TempDir::new().unwrap(),
            home: TempDir::new().unwrap(),
            launcher: Arc::new(FakeLauncher::default()),
            liveness: Arc::new(FakeLiveness::with_alive(alive)),
            recovery: Arc::new(RecordingRecovery::default()),
        }
    }

    fn key(&self, session: &str) -> SessionKey {
        SessionKey::new(self.project.path(), session)
    }

    fn config(&self) -> SupervisorConfig {
        SupervisorConfig {
            stall_timeout: Duration::from_secs(10 * 60),
            max_concurrent: 3,
            auto_restart: true,
            auto_launch: true,
            settle_delay: Duration::ZERO,
            recovery_timeout: Duration::from_secs(1),
            projects: vec![self.project.path().to_path_buf()],
            home: self.home.path().to_path_buf(),
            ..SupervisorConfig::default()
        }
    }

    fn supervisor(&self, config: SupervisorConfig) -> Supervisor {
        self.supervisor_with_recovery(config, self.recovery.clone())
    }

    fn supervisor_with_recovery(
        &self,
        config: SupervisorConfig,
        recovery: Arc<dyn RecoveryBridge>,
    ) -> Supervisor {
        Supervisor::new(
            config,
            SupervisorDeps {
                launcher: self.launcher.clone(),
                liveness: self.liveness.clone(),
                recovery,
                items: Arc::new(JsonlWorkItems),
            },
        )
    }

    fn launched(&self) -> Vec<String> {
        self.launcher
            .launched
            .lock()
            .unwrap()
            .iter()
            .map(|k| k.session_id.clone())
            .collect()
    }
}

fn write_identity(key: &SessionKey, pid: u32) {
    let identity = IdentityRecord {
        pid,
        session_id: key.session_id.clone(),
        project_dir: key.project.clone(),
        started_at: Utc::now(),
        max_iterations: 10,
        model: "opus".to_string(),
        provider: "claude".to_string(),
    };
    std::fs::create_dir_all(key.dir()).unwrap();
    std::fs::write(key.identity_path(), serde_json::to_string(&identity).unwrap()).unwrap();
}

/// Write a state record with an explicit `last_updated`, bypassing stamping.
fn write_state(key: &SessionKey, running: bool, last_updated: DateTime<Utc>) {
    let state = StateRecord {
        running,
        iteration: 4,
        max_iterations: 10,
        last_updated,
        started_at: last_updated,
        ..Default::default()
    };
    std::fs::create_dir_all(key.dir()).unwrap();
    std::fs::write(key.state_path(), serde_json::to_string(&state).unwrap()).unwrap();
}

fn write_items<S: AsRef<str>>(project: &Path, lines: &[S]) {
    let path = JsonlWorkItems::path(project);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let body: Vec<&str> = lines.iter().map(AsRef::as_ref).collect();
    std::fs::write(path, body.join("\n")).unwrap();
}

fn pending_for(session: &str, id: &str) -> String {
    format!(r#"{{"id": "{id}", "state": "pending", "sessions": ["{session}"]}}"#)
}

#[tokio::test]
async fn stalled_worker_is_restarted() {
    let h = Harness::new(&[4242]);
    let key = h.key("s1");
    write_identity(&key, 4242);
    write_state(&key, true, Utc::now() - chrono::Duration::minutes(20));

    let supervisor = h.supervisor(h.config());
    let statuses = supervisor.snapshot().await;
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].running);
    assert!(statuses[0].stalled);
    assert_eq!(statuses[0].pid, Some(4242));
    assert!(statuses[0].status.contains(STALLED));

    let report = supervisor.act(&statuses).await;
    assert_eq!(report.restarted, vec![key.clone()]);
    assert_eq!(*h.recovery.calls.lock().unwrap(), vec![key.clone()]);
    assert_eq!(*h.launcher.terminated.lock().unwrap(), vec![4242]);
    assert_eq!(h.launched(), vec!["s1"]);
    assert!(!key.identity_path().exists());
    assert!(!key.state_path().exists());
}

#[tokio::test]
async fn stalled_worker_left_alone_without_auto_restart() {
    let h = Harness::new(&[4242]);
    let key = h.key("s1");
    write_identity(&key, 4242);
    write_state(&key, true, Utc::now() - chrono::Duration::minutes(20));

    let config = SupervisorConfig {
        auto_restart: false,
        ..h.config()
    };
    let report = h.supervisor(config).poll_once().await;
    assert!(report.restarted.is_empty());
    assert!(h.launcher.terminated.lock().unwrap().is_empty());
    assert!(key.identity_path().exists());
}

#[tokio::test]
async fn idle_session_with_pending_work_is_launched() {
    let h = Harness::new(&[]);
    let key = h.key("s2");
    std::fs::create_dir_all(key.dir()).unwrap();
    write_items(
        h.project.path(),
        &[pending_for("s2", "b1"), pending_for("s2", "b2")],
    );

    let supervisor = h.supervisor(h.config());
    let statuses = supervisor.snapshot().await;
    assert_eq!(statuses[0].counts.pending, 2);
    assert!(!statuses[0].running);

    let report = supervisor.act(&statuses).await;
    assert_eq!(report.launched, vec![key]);
    assert!(h.recovery.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn session_without_open_work_is_untouched() {
    let h = Harness::new(&[]);
    std::fs::create_dir_all(h.key("s3").dir()).unwrap();
    write_items(
        h.project.path(),
        &[r#"{"id": "b1", "state": "complete", "sessions": ["s3"]}"#],
    );

    let report = h.supervisor(h.config()).poll_once().await;
    assert_eq!(report.sessions, 1);
    assert!(report.launched.is_empty());
    assert!(report.deferred.is_empty());
}

#[tokio::test]
async fn launches_respect_the_cap_in_discovery_order() {
    let h = Harness::new(&[]);
    let mut lines = Vec::new();
    for id in ["a", "b", "c", "d", "e"] {
        std::fs::create_dir_all(h.key(id).dir()).unwrap();
        lines.push(pending_for(id, &format!("item-{id}")));
    }
    write_items(h.project.path(), &lines);

    let config = SupervisorConfig {
        max_concurrent: 2,
        ..h.config()
    };
    let report = h.supervisor(config).poll_once().await;
    assert_eq!(h.launched(), vec!["a", "b"]);
    assert_eq!(
        report.deferred,
        vec![h.key("c"), h.key("d"), h.key("e")]
    );
}

#[tokio::test]
async fn healthy_workers_count_against_the_cap() {
    let h = Harness::new(&[7001]);
    let busy = h.key("busy");
    write_identity(&busy, 7001);
    write_state(&busy, true, Utc::now());
    std::fs::create_dir_all(h.key("idle1").dir()).unwrap();
    std::fs::create_dir_all(h.key("idle2").dir()).unwrap();
    write_items(
        h.project.path(),
        &[pending_for("idle1", "x"), pending_for("idle2", "y")],
    );

    let config = SupervisorConfig {
        max_concurrent: 2,
        ..h.config()
    };
    let report = h.supervisor(config).poll_once().await;
    assert_eq!(h.launched(), vec!["idle1"]);
    assert_eq!(report.deferred, vec![h.key("idle2")]);
}

#[tokio::test]
async fn failed_launch_does_not_stop_the_cycle() {
    let h = Harness::new(&[]);
    for id in ["a", "b"] {
        std::fs::create_dir_all(h.key(id).dir()).unwrap();
    }
    write_items(
        h.project.path(),
        &[pending_for("a", "x"), pending_for("b", "y")],
    );
    h.launcher.fail_for.lock().unwrap().insert("a".to_string());

    let report = h.supervisor(h.config()).poll_once().await;
    assert_eq!(report.failures, 1);
    assert_eq!(h.launched(), vec!["b"]);
}

#[tokio::test]
async fn dead_worker_state_is_corrected() {
    let h = Harness::new(&[]);
    let key = h.key("s4");
    write_state(&key, true, Utc::now());

    let config = SupervisorConfig {
        auto_launch: false,
        ..h.config()
    };
    let statuses = h.supervisor(config).snapshot().await;
    assert_eq!(statuses[0].status, EXITED_UNEXPECTEDLY);
    assert!(!statuses[0].running);

    let state = RecordStore::new(key).read_state().await.unwrap().unwrap();
    assert!(!state.running);
}

#[tokio::test]
async fn stale_identity_is_reclaimed_during_poll() {
    let h = Harness::new(&[]);
    let key = h.key("s5");
    write_identity(&key, 9999);
    write_state(&key, true, Utc::now());

    let statuses = h.supervisor(h.config()).snapshot().await;
    assert!(!statuses[0].running);
    assert!(!key.identity_path().exists());
    assert!(!key.state_path().exists());
}

#[tokio::test]
async fn corrupt_session_is_isolated() {
    let h = Harness::new(&[]);
    let bad = h.key("bad");
    std::fs::create_dir_all(bad.dir()).unwrap();
    std::fs::write(bad.identity_path(), "{{{").unwrap();
    std::fs::create_dir_all(h.key("good").dir()).unwrap();
    write_items(
        h.project.path(),
        &[pending_for("bad", "x"), pending_for("good", "y")],
    );

    let supervisor = h.supervisor(h.config());
    let statuses = supervisor.snapshot().await;
    assert!(statuses[0].error.is_some());
    assert!(statuses[1].error.is_none());

    let report = supervisor.act(&statuses).await;
    assert_eq!(h.launched(), vec!["good"]);
    assert_eq!(report.launched.len(), 1);
}

#[tokio::test]
async fn aggregate_directory_is_ignored() {
    let h = Harness::new(&[]);
    std::fs::create_dir_all(h.key("_all").dir()).unwrap();
    write_items(h.project.path(), &[r#"{"id": "x", "state": "pending"}"#]);

    let report = h.supervisor(h.config()).poll_once().await;
    assert_eq!(report.sessions, 0);
    assert!(h.launched().is_empty());
}

#[tokio::test]
async fn supervisor_start_and_stop() {
    let h = Harness::new(&[]);
    let key = h.key("s6");
    std::fs::create_dir_all(key.dir()).unwrap();
    write_items(h.project.path(), &[pending_for("s6", "x")]);

    let config = h.config();
    let record_path = config.supervisor_record_path();
    let handle = h.supervisor(config).start().await.unwrap();
    assert_eq!(handle.record().pid, std::process::id());
    assert!(record_path.exists());

    // The first cycle runs immediately.
    tokio::time::timeout(TEST_TIMEOUT, async {
        while h.launched().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first poll cycle did not launch");

    tokio::time::timeout(TEST_TIMEOUT, handle.stop())
        .await
        .expect("supervisor did not stop")
        .unwrap();
    assert!(!record_path.exists());
    assert!(
        supervisor_status(&record_path, h.liveness.as_ref())
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn recovered_command_survives_restart() {
    let h = Harness::new(&[4242]);
    let key = h.key("s7");
    write_identity(&key, 4242);
    write_state(&key, true, Utc::now() - chrono::Duration::minutes(20));
    std::fs::write(
        key.transcript_path(),
        "working...\nfleet-loop send /p s7 change_model sonnet\n",
    )
    .unwrap();

    let supervisor = h.supervisor_with_recovery(
        h.config(),
        Arc::new(TranscriptRecovery::new(Duration::from_secs(1))),
    );
    let report = supervisor.poll_once().await;
    assert_eq!(report.restarted, vec![key.clone()]);
    assert!(!key.identity_path().exists());
    assert!(!key.state_path().exists());

    let record = control::receive(&key).await.unwrap().unwrap();
    assert_eq!(record.command, ControlCommand::ChangeModel);
    assert_eq!(record.args, "sonnet");
}

#[tokio::test]
async fn restart_keeps_command_already_pending() {
    let h = Harness::new(&[4242]);
    let key = h.key("s8");
    write_identity(&key, 4242);
    write_state(&key, true, Utc::now() - chrono::Duration::minutes(30));
    control::send(&key, ControlCommand::Pause, "").await.unwrap();

    h.supervisor(h.config()).poll_once().await;
    assert_eq!(h.launched(), vec!["s8"]);
    let record = control::receive(&key).await.unwrap().unwrap();
    assert_eq!(record.command, ControlCommand::Pause);
}

#[tokio::test]
async fn live_worker_with_unreadable_state_holds_its_slot() {
    let h = Harness::new(&[7001]);
    let busy = h.key("busy");
    write_identity(&busy, 7001);
    std::fs::write(busy.state_path(), "{truncated").unwrap();
    std::fs::create_dir_all(h.key("idle").dir()).unwrap();
    write_items(h.project.path(), &[pending_for("idle", "x")]);

    let config = SupervisorConfig {
        max_concurrent: 1,
        ..h.config()
    };
    let supervisor = h.supervisor(config);
    let statuses = supervisor.snapshot().await;
    assert_eq!(statuses[0].key, busy);
    assert!(statuses[0].running);
    assert!(!statuses[0].stalled);
    assert_eq!(statuses[0].pid, Some(7001));
    assert!(statuses[0].error.is_some());

    let report = supervisor.act(&statuses).await;
    assert!(h.launched().is_empty());
    assert_eq!(report.deferred, vec![h.key("idle")]);
    assert!(h.launcher.terminated.lock().unwrap().is_empty());
}
