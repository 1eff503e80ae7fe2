//! Tracing setup: stderr plus an optional log file.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Build the level filter. An explicit level wins; `RUST_LOG` is used when
/// the level does not parse; `info` otherwise.
pub fn env_filter(level: Option<&str>) -> EnvFilter {
    level
        .and_then(|l| EnvFilter::try_new(l).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// When `log_file` is given, events are also appended to it through a
/// non-blocking writer. The returned guard must be kept alive until exit or
/// buffered lines are lost.
pub fn init(level: Option<&str>, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    init_with_stderr(level, log_file, true)
}

/// Like [`init`], optionally without the stderr layer. A detached daemon's
/// stderr already points at the log file.
pub fn init_with_stderr(
    level: Option<&str>,
    log_file: Option<&Path>,
    stderr: bool,
) -> Result<Option<WorkerGuard>> {
    let stderr_layer = stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
    });

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let file_name = path
                .file_name()
                .context("log file path has no file name")?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_level_is_used() {
        assert_eq!(env_filter(Some("debug")).to_string(), "debug");
        assert_eq!(env_filter(Some("histsync=trace")).to_string(), "histsync=trace");
    }
}
