//! Process liveness and stale-record reclamation.

use crate::error::RecordError;
use crate::records::{IdentityRecord, RecordStore};

/// Decides whether a process is still alive.
pub trait Liveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probes with signal 0: no signal is delivered, only existence and
/// permission are checked. Any error (ESRCH, EPERM) means "not alive".
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

impl Liveness for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }
}

/// Check whether a process with the given PID is alive.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // 0 would address our own process group; values past i32::MAX wrap
    // negative and address other groups.
    let Ok(raw_pid) = i32::try_from(pid) else {
        return false;
    };
    if raw_pid <= 0 {
        return false;
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw_pid), None).is_ok()
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

/// Whether the worker owning `store`'s session is running.
///
/// Returns the identity when its pid is alive. An identity naming a dead pid
/// is stale: its identity and state records are deleted here so that
/// "identity exists" keeps implying "a live process probably owns it".
pub async fn check_running(
    store: &RecordStore,
    probe: &dyn Liveness,
) -> Result<Option<IdentityRecord>, RecordError> {
    let Some(identity) = store.read_identity().await? else {
        return Ok(None);
    };

    if probe.is_alive(identity.pid) {
        return Ok(Some(identity));
    }

    tracing::info!(
        session = %store.key(),
        pid = identity.pid,
        "Reclaiming stale records of dead worker"
    );
    store.remove_worker_records().await?;
    Ok(None)
}
