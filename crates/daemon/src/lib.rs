//! histsync daemon library.
//!
//! Process lifecycle around the core sync strategies: pid file handling,
//! signal-driven shutdown, the periodic sync loop and logging setup. Used by
//! the `histsync` binary and by the integration tests.

pub mod controller;
pub mod daemon;
pub mod logging;
pub mod scheduler;
pub mod signals;

pub use controller::{DaemonController, DaemonError, DaemonState, SyncState};
