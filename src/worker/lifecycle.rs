//! Worker-side lifecycle: register, publish progress, obey commands, clean up.
//!
//! A worker's own loop drives this once per iteration:
//!
//! ```ignore
//! let mut worker = WorkerLifecycle::start(key, options).await?;
//! loop {
//!     match worker.poll().await? {
//!         Directive::Exit => break,
//!         Directive::ChangeModel(model) => use_model(model),
//!         _ => {}
//!     }
//!     if worker.state() == WorkerState::Running {
//!         do_one_iteration(&mut worker);
//!     }
//!     worker.publish().await?;
//! }
//! ```
//!
//! A crash skips [`WorkerLifecycle::shutdown`]; stale records are then
//! reclaimed by the first liveness check that notices the dead pid.

use chrono::{DateTime, Utc};

use crate::control;
use crate::error::LifecycleError;
use crate::records::{IdentityRecord, RecordStore, SessionKey, StateRecord};
use crate::worker::state::{Directive, WorkerState};

/// Static parameters of a worker run.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub max_iterations: u32,
    pub model: String,
    pub provider: String,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            model: "opus".to_string(),
            provider: "claude".to_string(),
        }
    }
}

/// Per-iteration progress reported by the worker's business logic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub current_item_id: String,
    pub current_item_title: String,
    pub iteration: u32,
    pub files_changed: u32,
    pub criteria_complete: u32,
    pub criteria_total: u32,
}

/// Owns a session's identity and state records while the worker lives.
pub struct WorkerLifecycle {
    store: RecordStore,
    state: WorkerState,
    options: WorkerOptions,
    started_at: DateTime<Utc>,
    progress: Progress,
}

impl WorkerLifecycle {
    /// Register the worker. Failure to write the identity aborts startup.
    pub async fn start(key: SessionKey, options: WorkerOptions) -> Result<Self, LifecycleError> {
        let store = RecordStore::new(key);
        let started_at = Utc::now();

        let identity = IdentityRecord {
            pid: std::process::id(),
            session_id: store.key().session_id.clone(),
            project_dir: store.key().project.clone(),
            started_at,
            max_iterations: options.max_iterations,
            model: options.model.clone(),
            provider: options.provider.clone(),
        };
        store
            .write_identity(&identity)
            .await
            .map_err(LifecycleError::Startup)?;

        let mut worker = Self {
            store,
            state: WorkerState::Starting,
            options,
            started_at,
            progress: Progress::default(),
        };
        worker.state = WorkerState::Running;
        worker.publish().await?;

        tracing::info!(
            session = %worker.store.key(),
            pid = identity.pid,
            model = %worker.options.model,
            "Worker registered"
        );
        Ok(worker)
    }

    pub fn key(&self) -> &SessionKey {
        self.store.key()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn model(&self) -> &str {
        &self.options.model
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Replace the progress included in the next published state.
    pub fn record_progress(&mut self, progress: Progress) {
        self.progress = progress;
    }

    /// Build the state record for the current instant (unstamped).
    pub fn snapshot(&self) -> StateRecord {
        StateRecord {
            running: self.state.accepts_commands(),
            paused: self.state == WorkerState::Paused,
            current_item_id: self.progress.current_item_id.clone(),
            current_item_title: self.progress.current_item_title.clone(),
            iteration: self.progress.iteration,
            max_iterations: self.options.max_iterations,
            files_changed: self.progress.files_changed,
            criteria_complete: self.progress.criteria_complete,
            criteria_total: self.progress.criteria_total,
            model: self.options.model.clone(),
            provider: self.options.provider.clone(),
            last_updated: DateTime::<Utc>::UNIX_EPOCH,
            started_at: self.started_at,
        }
    }

    /// Write a fresh state record. Also the worker's heartbeat.
    pub async fn publish(&mut self) -> Result<(), LifecycleError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let mut state = self.snapshot();
        self.store.write_state(&mut state).await?;
        Ok(())
    }

    /// Claim and apply at most one pending command.
    ///
    /// `cancel` removes every record before returning [`Directive::Exit`].
    pub async fn poll(&mut self) -> Result<Directive, LifecycleError> {
        let record = match control::receive(self.store.key()).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(Directive::Continue),
            Err(e) => {
                // The claimed file is already gone; the next poll starts clean.
                tracing::warn!(session = %self.store.key(), error = %e, "Ignoring unreadable command");
                return Ok(Directive::Continue);
            }
        };

        let (next, directive) = self.state.apply(record.command, &record.args)?;
        tracing::info!(
            session = %self.store.key(),
            command = %record.command,
            from = %self.state,
            to = %next,
            "Control command applied"
        );

        if directive == Directive::Exit {
            self.terminate().await?;
            return Ok(directive);
        }
        match &directive {
            Directive::ChangeModel(model) => {
                self.options.model = model.clone();
            }
            Directive::SkipCurrent => {
                self.progress.current_item_id.clear();
                self.progress.current_item_title.clear();
            }
            _ => {}
        }
        self.state = next;
        self.publish().await?;
        Ok(directive)
    }

    /// Normal exit: remove identity, state and any pending command.
    pub async fn shutdown(mut self) -> Result<(), LifecycleError> {
        self.terminate().await
    }

    async fn terminate(&mut self) -> Result<(), LifecycleError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.state = WorkerState::Terminated;
        self.store.remove_all().await?;
        tracing::info!(session = %self.store.key(), "Worker records removed");
        Ok(())
    }
}
