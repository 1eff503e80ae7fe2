//! Graceful shutdown signal handling for the sync daemon.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

pub use histsync_core::models::ShutdownFlag;

/// A flag nobody has raised yet, with no signal handlers attached.
pub fn new_shutdown_flag() -> ShutdownFlag {
    Arc::new(AtomicBool::new(false))
}

/// Create a new shutdown flag and register OS signal handlers.
///
/// On SIGTERM or SIGINT (Ctrl+C), the flag is set to `true`.
/// Must be called from within a tokio runtime.
pub fn setup_signal_handlers() -> io::Result<ShutdownFlag> {
    let flag = new_shutdown_flag();
    let flag_clone = flag.clone();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("received SIGINT (Ctrl+C), stopping at the next checkpoint");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, stopping at the next checkpoint");
                }
            }
            flag_clone.store(true, Ordering::SeqCst);
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl+C, initiating shutdown");
                flag_clone.store(true, Ordering::SeqCst);
            }
        });
    }

    Ok(flag)
}

/// Check whether the shutdown flag has been set.
pub fn is_shutdown_requested(flag: &ShutdownFlag) -> bool {
    flag.load(Ordering::SeqCst)
}

/// Raise the flag from inside the process.
pub fn request_shutdown(flag: &ShutdownFlag) {
    flag.store(true, Ordering::SeqCst);
}
