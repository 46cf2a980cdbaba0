//! fleet-loop — file-based coordination of long-running agent loop workers.

pub mod config;
pub mod control;
pub mod discovery;
pub mod error;
pub mod items;
pub mod launcher;
pub mod liveness;
pub mod records;
pub mod recovery;
pub mod supervisor;
pub mod worker;
