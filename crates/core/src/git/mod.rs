//! Git operations for the history repository.

pub mod client;

pub use client::GitClient;
