//! histsync core library.
//!
//! This crate provides the building blocks for keeping a shell history in
//! sync across machines: the history model and merge engine, configuration,
//! advisory locks, remote transports, and the sync strategies.

pub mod config;
pub mod errors;
pub mod git;
pub mod history;
pub mod lock;
pub mod models;
pub mod strategy;
pub mod transport;

// Re-exports for convenience.
pub use config::HistSyncConfig;
pub use history::{HistoryRecord, HistorySet};
pub use models::SyncResult;
pub use strategy::SyncStrategy;
