//! In-process "remote" for tests and dry runs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use super::write_back_local;
use crate::config::HistSyncConfig;
use crate::errors::SyncError;
use crate::history::{self, HistorySet, TextEncoding};
use crate::models::{shutdown_raised, ShutdownFlag, SyncResult};

const LATENCY_SLICE: Duration = Duration::from_millis(50);

/// Keeps the remote history in a shared buffer. Clones share both the
/// buffer and the injected failure counter.
#[derive(Debug, Clone)]
pub struct MemoryStrategy {
    remote: Arc<Mutex<String>>,
    pending_failures: Arc<AtomicU32>,
    local_history: PathBuf,
    encodings: Vec<TextEncoding>,
    /// Simulated round-trip before each operation reaches the remote.
    latency: Duration,
    shutdown: Option<ShutdownFlag>,
}

impl MemoryStrategy {
    pub fn new(local_history: impl Into<PathBuf>, encodings: Vec<TextEncoding>) -> Self {
        Self {
            remote: Arc::new(Mutex::new(String::new())),
            pending_failures: Arc::new(AtomicU32::new(0)),
            local_history: local_history.into(),
            encodings,
            latency: Duration::ZERO,
            shutdown: None,
        }
    }

    pub fn from_config(config: &HistSyncConfig) -> Self {
        Self::new(
            config.paths.local_history.clone(),
            config.settings.encodings.clone(),
        )
    }

    /// Another machine's view of the same remote, with its own local file.
    pub fn sharing_remote(&self, local_history: impl Into<PathBuf>) -> Self {
        Self {
            local_history: local_history.into(),
            ..self.clone()
        }
    }

    /// Make the next `n` sync or clear calls fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Wait `latency` before each sync or clear reaches the remote.
    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    /// Cut the simulated wait short once `flag` is raised.
    pub fn set_shutdown(&mut self, flag: ShutdownFlag) {
        self.shutdown = Some(flag);
    }

    pub async fn remote_contents(&self) -> String {
        self.remote.lock().await.clone()
    }

    pub async fn set_remote_contents(&self, text: impl Into<String>) {
        *self.remote.lock().await = text.into();
    }

    fn injected_failure(&self) -> Result<(), SyncError> {
        let took = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if took.is_ok() {
            warn!("injected transport failure");
            return Err(SyncError::transport("simulated transport failure"));
        }
        Ok(())
    }

    async fn simulated_round_trip(&self) -> Result<(), SyncError> {
        let mut waited = Duration::ZERO;
        while waited < self.latency {
            if shutdown_raised(self.shutdown.as_ref()) {
                info!("shutdown requested during remote round-trip");
                return Err(SyncError::Interrupted);
            }
            let step = LATENCY_SLICE.min(self.latency - waited);
            tokio::time::sleep(step).await;
            waited += step;
        }
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<SyncResult, SyncError> {
        self.injected_failure()?;
        self.simulated_round_trip().await?;
        let mut remote_text = self.remote.lock().await;
        let remote = history::parse(&remote_text);
        let local = history::read_history_file(&self.local_history, &self.encodings)?;
        let (merged, stats) = history::merge_report(&local, &remote);

        let remote_changed = merged != remote;
        if remote_changed {
            *remote_text = history::serialize(&merged);
        }
        let added_locally = write_back_local(&self.local_history, &self.encodings, &merged)?;

        Ok(SyncResult {
            merged_count: merged.len(),
            conflicts_resolved: stats.conflicts_resolved,
            added_locally,
            added_remotely: stats.only_local,
            remote_changed,
        })
    }

    pub async fn clear_remote(&mut self) -> Result<(), SyncError> {
        self.injected_failure()?;
        self.simulated_round_trip().await?;
        *self.remote.lock().await = history::serialize(&HistorySet::new());
        Ok(())
    }
}
