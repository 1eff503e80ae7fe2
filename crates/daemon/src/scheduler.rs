//! Periodic sync loop for the daemon.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use histsync_core::errors::SyncError;
use histsync_core::strategy::SyncStrategy;

use crate::controller::SyncState;
use crate::signals::{is_shutdown_requested, ShutdownFlag};

/// Longest uninterrupted sleep between shutdown checks.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Run sync cycles every `interval` until shutdown is requested.
///
/// Shutdown is honoured between cycles, while sleeping, and at the
/// strategy's own checkpoints (lock waits, push retries) when the flag has
/// been attached to it. Cycle failures are logged, recorded in `state`, and
/// the loop carries on.
pub async fn run_sync_loop(
    strategy: &mut SyncStrategy,
    interval: Duration,
    shutdown: &ShutdownFlag,
    state: &mut SyncState,
) {
    info!(
        interval_secs = interval.as_secs(),
        strategy = strategy.name(),
        "starting sync loop"
    );

    loop {
        if is_shutdown_requested(shutdown) {
            info!("shutdown requested, exiting sync loop");
            break;
        }

        state.cycles += 1;
        match strategy.sync().await {
            Ok(result) => {
                state.last_sync_at = Some(Utc::now());
                state.last_error = None;
                if result.remote_changed || result.added_locally > 0 {
                    info!(
                        cycle = state.cycles,
                        merged = result.merged_count,
                        added_locally = result.added_locally,
                        added_remotely = result.added_remotely,
                        "sync cycle completed with changes"
                    );
                } else {
                    debug!(cycle = state.cycles, "sync cycle completed, nothing new");
                }
            }
            Err(SyncError::Interrupted) => {
                info!(cycle = state.cycles, "sync cycle interrupted by shutdown");
                break;
            }
            Err(e) => {
                state.failures += 1;
                state.last_error = Some(e.to_string());
                error!(cycle = state.cycles, error = %e, "sync cycle failed");
            }
        }

        if sleep_until_next_cycle(interval, shutdown).await {
            info!("shutdown requested during sleep, exiting");
            break;
        }
    }
}

/// Sleep for `interval` in short slices. Returns `true` if shutdown was
/// requested meanwhile.
async fn sleep_until_next_cycle(interval: Duration, shutdown: &ShutdownFlag) -> bool {
    let mut slept = Duration::ZERO;
    while slept < interval {
        if is_shutdown_requested(shutdown) {
            return true;
        }
        let step = SLEEP_SLICE.min(interval - slept);
        tokio::time::sleep(step).await;
        slept += step;
    }
    is_shutdown_requested(shutdown)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use histsync_core::history::TextEncoding;
    use histsync_core::strategy::MemoryStrategy;

    use super::*;
    use crate::signals::{new_shutdown_flag, request_shutdown};

    #[tokio::test]
    async fn test_sleep_wakes_early_on_shutdown() {
        let flag = new_shutdown_flag();
        let setter = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            request_shutdown(&setter);
        });

        let started = Instant::now();
        assert!(sleep_until_next_cycle(Duration::from_secs(30), &flag).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_interrupted_cycle_ends_loop_without_failure() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("history");
        std::fs::write(&local, ": 1:0;ls\n").unwrap();
        let mut memory = MemoryStrategy::new(&local, TextEncoding::defaults());
        memory.set_latency(Duration::from_secs(30));
        let mut strategy = SyncStrategy::Memory(memory.clone());

        let flag = new_shutdown_flag();
        strategy.attach_shutdown(flag.clone());
        let setter = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            request_shutdown(&setter);
        });

        let started = Instant::now();
        let mut state = SyncState::new(dir.path().join("histsync.pid"));
        run_sync_loop(&mut strategy, Duration::from_secs(60), &flag, &mut state).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(state.cycles, 1);
        assert_eq!(state.failures, 0);
        assert_eq!(state.last_error, None);
        assert_eq!(memory.remote_contents().await, "");
    }

    #[tokio::test]
    async fn test_sleep_runs_full_interval() {
        let flag = new_shutdown_flag();
        assert!(!sleep_until_next_cycle(Duration::from_millis(50), &flag).await);
    }
}
