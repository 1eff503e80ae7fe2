//! Domain model types shared by the sync strategies and the daemon.

use std::ffi::CStr;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Sync result
// ---------------------------------------------------------------------------

/// Outcome of one successful sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Number of records in the merged history.
    pub merged_count: usize,
    /// Commands whose timestamps disagreed between the two sides, plus
    /// rejected pushes recovered by re-merging.
    pub conflicts_resolved: u64,
    /// Records the local history file gained.
    pub added_locally: u64,
    /// Records the remote history gained.
    pub added_remotely: u64,
    /// Whether the remote copy was rewritten.
    pub remote_changed: bool,
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records ({} new locally, {} new remotely, {} conflicts resolved{})",
            self.merged_count,
            self.added_locally,
            self.added_remotely,
            self.conflicts_resolved,
            if self.remote_changed { ", remote updated" } else { "" }
        )
    }
}

// ---------------------------------------------------------------------------
// Host identity
// ---------------------------------------------------------------------------

/// Name of this machine, for lock holders and commit messages.
pub fn hostname() -> String {
    let mut buf = [0 as libc::c_char; 256];
    // SAFETY: buf is writable for its full length; gethostname truncates.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len() - 1) };
    if rc == 0 {
        // SAFETY: the last byte is never written, so the buffer is NUL-terminated.
        let name = unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy();
        if !name.is_empty() {
            return name.into_owned();
        }
    }
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".into())
}

/// Lock holder identity for this process: `"<pid>@<hostname>"`.
pub fn holder_token() -> String {
    format!("{}@{}", std::process::id(), hostname())
}

/// Current time as unix seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Raised when the process has been asked to stop. Long waits inside a
/// sync cycle poll it so a stop request does not sit behind a lock timeout.
pub type ShutdownFlag = Arc<AtomicBool>;

/// Whether an optional shutdown flag has been raised.
pub fn shutdown_raised(flag: Option<&ShutdownFlag>) -> bool {
    flag.is_some_and(|f| f.load(Ordering::SeqCst))
}
