//! Worker side of the coordination protocol.
//!
//! - `state` — run state machine (Starting → Running ⇄ Paused → Terminated)
//! - `lifecycle` — identity registration, state publishing, command polling

pub mod lifecycle;
pub mod state;

pub use lifecycle::{Progress, WorkerLifecycle, WorkerOptions};
pub use state::{Directive, WorkerState};
