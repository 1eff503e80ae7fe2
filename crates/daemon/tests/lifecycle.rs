//! Daemon controller lifecycle against real pid files and processes.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use histsync::controller::{build_strategy, DaemonController, DaemonError, DaemonState};
use histsync::daemon::detached_command;
use histsync::signals::{new_shutdown_flag, request_shutdown};
use histsync_core::config::{HistSyncConfig, SyncType};
use histsync_core::errors::{ConfigError, CoreError, SyncError};
use histsync_core::history::TextEncoding;
use histsync_core::strategy::{MemoryStrategy, SyncStrategy};

fn memory_strategy(dir: &Path) -> (MemoryStrategy, SyncStrategy) {
    let local = dir.join("zsh_history");
    std::fs::write(&local, ": 100:0;ls\n").unwrap();
    let memory = MemoryStrategy::new(&local, TextEncoding::defaults());
    (memory.clone(), SyncStrategy::Memory(memory))
}

/// Pid of a process that has already exited and been reaped.
fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[tokio::test]
async fn test_start_refuses_when_pid_file_names_live_process() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("histsync.pid");
    std::fs::write(&pid_path, format!("{}\n", std::process::id())).unwrap();

    let (_, mut strategy) = memory_strategy(dir.path());
    let mut controller = DaemonController::new(&pid_path, Duration::from_millis(50));
    let err = controller
        .start(&mut strategy, new_shutdown_flag())
        .await
        .unwrap_err();

    assert!(matches!(err, DaemonError::AlreadyRunning { pid } if pid == std::process::id()));
    assert_eq!(controller.state(), DaemonState::Stopped);
    assert!(pid_path.exists());
}

#[tokio::test]
async fn test_start_replaces_stale_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("histsync.pid");
    std::fs::write(&pid_path, format!("{} 1700000000\n", dead_pid())).unwrap();

    let (memory, mut strategy) = memory_strategy(dir.path());
    let shutdown = new_shutdown_flag();
    request_shutdown(&shutdown);

    let mut controller = DaemonController::new(&pid_path, Duration::from_millis(50));
    let state = controller.start(&mut strategy, shutdown).await.unwrap();

    assert_eq!(state.cycles, 0);
    assert!(!state.running);
    assert!(!pid_path.exists());
    assert_eq!(memory.remote_contents().await, "");
}

#[tokio::test]
async fn test_stop_without_pid_file_is_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let mut controller =
        DaemonController::new(dir.path().join("histsync.pid"), Duration::from_secs(60));

    let err = controller.stop(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, DaemonError::NotRunning));
    assert_eq!(controller.status().unwrap(), None);
}

#[tokio::test]
async fn test_stop_cleans_up_dead_pid() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("histsync.pid");
    std::fs::write(&pid_path, format!("{}\n", dead_pid())).unwrap();

    let mut controller = DaemonController::new(&pid_path, Duration::from_secs(60));
    let err = controller.stop(Duration::from_secs(1)).await.unwrap_err();

    assert!(matches!(err, DaemonError::NotRunning));
    assert!(!pid_path.exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_stop_terminates_live_process() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("histsync.pid");

    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();
    std::fs::write(&pid_path, format!("{}\n", pid)).unwrap();
    // Reap the child so it does not linger as a zombie once signalled.
    let reaper = std::thread::spawn(move || child.wait());

    let mut controller = DaemonController::new(&pid_path, Duration::from_secs(60));
    assert_eq!(controller.status().unwrap(), Some(pid));

    let stopped = controller.stop(Duration::from_secs(5)).await.unwrap();
    assert_eq!(stopped, pid);
    assert!(!pid_path.exists());
    assert_eq!(controller.state(), DaemonState::Stopped);

    let status = reaper.join().unwrap().unwrap();
    assert!(!status.success());
}

#[tokio::test]
async fn test_restart_with_nothing_running_starts_here() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("histsync.pid");
    let (_, mut strategy) = memory_strategy(dir.path());
    let shutdown = new_shutdown_flag();
    request_shutdown(&shutdown);

    let mut controller = DaemonController::new(&pid_path, Duration::from_millis(50));
    let state = controller
        .restart(&mut strategy, Duration::from_secs(1), shutdown)
        .await
        .unwrap();

    assert_eq!(state.cycles, 0);
    assert!(!pid_path.exists());
    assert_eq!(controller.state(), DaemonState::Stopped);
}

#[tokio::test]
async fn test_loop_survives_failed_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("histsync.pid");
    let (memory, mut strategy) = memory_strategy(dir.path());
    memory.fail_next(1);

    let shutdown = new_shutdown_flag();
    let setter = shutdown.clone();
    let watched_pid = pid_path.clone();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(450)).await;
        let pid_file_present = watched_pid.exists();
        request_shutdown(&setter);
        pid_file_present
    });

    let mut controller = DaemonController::new(&pid_path, Duration::from_millis(100));
    let state = controller.start(&mut strategy, shutdown).await.unwrap();

    assert!(stopper.await.unwrap(), "pid file exists while running");
    assert!(!pid_path.exists());
    assert!(state.cycles >= 2);
    assert_eq!(state.failures, 1);
    assert!(state.last_sync_at.is_some());
    assert_eq!(state.last_error, None);
    assert_eq!(memory.remote_contents().await, ": 100:0;ls\n");
}

#[tokio::test]
async fn test_sync_once_leaves_pid_file_alone() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("histsync.pid");
    let (memory, mut strategy) = memory_strategy(dir.path());

    let mut controller = DaemonController::new(&pid_path, Duration::from_secs(60));
    let result = controller.sync_once(&mut strategy).await.unwrap();

    assert_eq!(result.merged_count, 1);
    assert!(result.remote_changed);
    assert!(!pid_path.exists());
    assert_eq!(memory.remote_contents().await, ": 100:0;ls\n");

    controller.clear_remote(&mut strategy).await.unwrap();
    assert_eq!(memory.remote_contents().await, "");
}

#[tokio::test]
async fn test_sync_failure_surfaces_as_core_error() {
    let dir = tempfile::tempdir().unwrap();
    let (memory, mut strategy) = memory_strategy(dir.path());
    memory.fail_next(1);

    let mut controller = DaemonController::new(dir.path().join("histsync.pid"), Duration::from_secs(60));
    let err = controller.sync_once(&mut strategy).await.unwrap_err();
    assert!(matches!(
        err,
        DaemonError::Core(CoreError::Sync(SyncError::Transport { .. }))
    ));
}

#[test]
fn test_bad_strategy_config_surfaces_as_core_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = HistSyncConfig::default();
    config.paths.local_history = dir.path().join("history");
    config.settings.sync_type = SyncType::Ssh;

    let err = build_strategy(&config).err().unwrap();
    assert!(matches!(
        err,
        DaemonError::Core(CoreError::Config(ConfigError::InvalidValue { .. }))
    ));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_stop_leaves_reused_pid_alone() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("histsync.pid");
    // Our own pid, recorded as if written long before this process started.
    std::fs::write(&pid_path, format!("{} 1000\n", std::process::id())).unwrap();

    let mut controller = DaemonController::new(&pid_path, Duration::from_secs(60));
    let err = controller.stop(Duration::from_secs(1)).await.unwrap_err();

    assert!(matches!(err, DaemonError::NotRunning));
    assert!(!pid_path.exists());
}

/// A stand-in daemon: claims the pid file, removes it on SIGTERM.
#[cfg(unix)]
const FAKE_DAEMON: &str = "echo \"$$ $(date +%s)\" > \"$PIDFILE\"
trap 'rm -f \"$PIDFILE\"; kill $! 2>/dev/null; exit 0' TERM
sleep 30 &
wait";

#[cfg(unix)]
#[tokio::test]
async fn test_detached_daemon_runs_until_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("histsync.pid");
    let log = dir.path().join("histsync.log");

    let mut command = detached_command(Path::new("sh"), ["-c", FAKE_DAEMON], &log).unwrap();
    command.env("PIDFILE", &pid_path);

    let mut controller = DaemonController::new(&pid_path, Duration::from_secs(60));
    let mut child = controller
        .start_detached(command, Duration::from_secs(5))
        .await
        .unwrap();
    let pid = child.id();
    assert_eq!(controller.state(), DaemonState::Running);
    assert_eq!(controller.status().unwrap(), Some(pid));
    assert!(log.exists());

    // A second background start is refused while the first one runs.
    let again = detached_command(Path::new("sh"), ["-c", FAKE_DAEMON], &log).unwrap();
    let err = controller
        .start_detached(again, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::AlreadyRunning { pid: p } if p == pid));

    assert_eq!(controller.stop(Duration::from_secs(5)).await.unwrap(), pid);
    assert!(!pid_path.exists());
    assert!(child.wait().unwrap().success());
}

#[cfg(unix)]
#[tokio::test]
async fn test_detached_daemon_that_dies_early_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("histsync.pid");
    let log = dir.path().join("histsync.log");
    let command =
        detached_command(Path::new("sh"), ["-c", "echo 'bad config' >&2; exit 3"], &log).unwrap();

    let mut controller = DaemonController::new(&pid_path, Duration::from_secs(60));
    let err = controller
        .start_detached(command, Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(err, DaemonError::Spawn(_)));
    assert_eq!(controller.state(), DaemonState::Stopped);
    assert!(!pid_path.exists());
    assert!(std::fs::read_to_string(&log).unwrap().contains("bad config"));
}
