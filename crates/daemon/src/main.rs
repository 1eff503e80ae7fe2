//! histsync: keep shell history in sync across machines.
//!
//! One-shot syncs, remote clearing, and a daemon that syncs on a fixed
//! interval until it receives SIGTERM or SIGINT, either in the foreground or
//! detached into the background.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use histsync::controller::{
    build_strategy, DaemonController, DEFAULT_STARTUP_WAIT, DEFAULT_STOP_GRACE,
};
use histsync::{daemon, logging, signals};
use histsync_core::config::{expand_tilde, HistSyncConfig};

/// Serverless shell history synchronization over Git or SSH.
#[derive(Parser)]
#[command(name = "histsync", version, about)]
struct Cli {
    /// Path to the config file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "~/.config/histsync/config.toml"
    )]
    config: String,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single sync cycle and exit.
    #[command(alias = "sync-once")]
    Sync,

    /// Empty the shared remote history. Local history is kept.
    ClearRemote,

    /// Manage the background sync daemon.
    Daemon {
        #[command(subcommand)]
        action: DaemonCommand,
    },

    /// Write a default config file.
    Init,
}

#[derive(Subcommand)]
enum DaemonCommand {
    /// Run the sync loop until SIGTERM/SIGINT.
    Start {
        /// Run in the background (default is foreground).
        #[arg(long)]
        detach: bool,

        /// Set on the re-run process of `--detach`; its stderr is the log file.
        #[arg(long, hide = true)]
        detached_child: bool,
    },

    /// Stop the running daemon.
    Stop {
        /// Seconds to wait for the daemon to finish its current cycle.
        #[arg(long, default_value_t = DEFAULT_STOP_GRACE.as_secs())]
        grace_secs: u64,
    },

    /// Stop the running daemon, if any, and start a new one.
    Restart {
        #[arg(long, default_value_t = DEFAULT_STOP_GRACE.as_secs())]
        grace_secs: u64,

        /// Run the new daemon in the background.
        #[arg(long)]
        detach: bool,
    },

    /// Check daemon status.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(Path::new(&cli.config));

    if let Commands::Init = cli.command {
        logging::init(cli.log_level.as_deref(), None)?;
        return cmd_init(&config_path);
    }

    let config = HistSyncConfig::load_and_resolve(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.settings.log_level);
    let detached_child = matches!(
        cli.command,
        Commands::Daemon {
            action: DaemonCommand::Start {
                detached_child: true,
                ..
            }
        }
    );
    let _log_guard = logging::init_with_stderr(
        Some(level),
        Some(&config.paths.log_file),
        !detached_child,
    )?;

    match cli.command {
        Commands::Sync => cmd_sync(&config).await,
        Commands::ClearRemote => cmd_clear_remote(&config).await,
        Commands::Daemon { action } => match action {
            DaemonCommand::Start { detach: true, .. } => {
                cmd_start_detached(&config, &config_path, cli.log_level.as_deref()).await
            }
            DaemonCommand::Start { .. } => cmd_start(&config).await,
            DaemonCommand::Stop { grace_secs } => {
                cmd_stop(&config, Duration::from_secs(grace_secs)).await
            }
            DaemonCommand::Restart { grace_secs, detach } => {
                let grace = Duration::from_secs(grace_secs);
                if detach {
                    cmd_restart_detached(&config, &config_path, cli.log_level.as_deref(), grace)
                        .await
                } else {
                    cmd_restart(&config, grace).await
                }
            }
            DaemonCommand::Status => cmd_status(&config),
        },
        Commands::Init => cmd_init(&config_path),
    }
}

fn controller(config: &HistSyncConfig) -> DaemonController {
    DaemonController::new(&config.paths.pid_file, config.sync_interval())
}

/// This binary, re-run as a foreground daemon in its own session.
fn background_command(
    config: &HistSyncConfig,
    config_path: &Path,
    log_level: Option<&str>,
) -> Result<Command> {
    let exe = std::env::current_exe().context("cannot locate the histsync executable")?;
    let config_path = std::path::absolute(config_path)
        .with_context(|| format!("cannot resolve {}", config_path.display()))?;
    daemon::detached_command(
        &exe,
        daemon::foreground_args(&config_path, log_level),
        &config.paths.log_file,
    )
    .with_context(|| format!("cannot open log file {}", config.paths.log_file.display()))
}

/// Write the default config template.
fn cmd_init(path: &Path) -> Result<()> {
    HistSyncConfig::write_default(path)
        .with_context(|| format!("failed to write config {}", path.display()))?;
    println!("✓ Wrote default config to {}", path.display());
    Ok(())
}

/// Run a single sync cycle.
async fn cmd_sync(config: &HistSyncConfig) -> Result<()> {
    let mut strategy = build_strategy(config).context("failed to set up sync strategy")?;
    info!(strategy = strategy.name(), "running single sync cycle");
    let result = controller(config)
        .sync_once(&mut strategy)
        .await
        .context("sync failed")?;
    println!("Sync complete: {}", result);
    Ok(())
}

async fn cmd_clear_remote(config: &HistSyncConfig) -> Result<()> {
    let mut strategy = build_strategy(config).context("failed to set up sync strategy")?;
    controller(config)
        .clear_remote(&mut strategy)
        .await
        .context("failed to clear remote history")?;
    println!("✓ Remote history cleared");
    Ok(())
}

/// Start the sync daemon in the foreground.
async fn cmd_start(config: &HistSyncConfig) -> Result<()> {
    let mut strategy = build_strategy(config).context("failed to set up sync strategy")?;
    let shutdown = signals::setup_signal_handlers().context("failed to install signal handlers")?;
    info!(
        strategy = strategy.name(),
        interval_secs = config.settings.sync_interval_seconds,
        pid_file = %config.paths.pid_file.display(),
        "starting histsync daemon"
    );
    let state = controller(config).start(&mut strategy, shutdown).await?;
    println!(
        "Daemon exited after {} cycles ({} failed)",
        state.cycles, state.failures
    );
    Ok(())
}

/// Stop the daemon.
async fn cmd_stop(config: &HistSyncConfig, grace: Duration) -> Result<()> {
    let pid = controller(config).stop(grace).await?;
    println!("✓ Daemon (PID {}) stopped gracefully", pid);
    Ok(())
}

/// Start the sync daemon in the background.
async fn cmd_start_detached(
    config: &HistSyncConfig,
    config_path: &Path,
    log_level: Option<&str>,
) -> Result<()> {
    // Fail here, not in the background, on a broken strategy config.
    build_strategy(config).context("failed to set up sync strategy")?;
    let command = background_command(config, config_path, log_level)?;
    let child = controller(config)
        .start_detached(command, DEFAULT_STARTUP_WAIT)
        .await?;
    println!(
        "✓ Daemon started in background (PID {}), logging to {}",
        child.id(),
        config.paths.log_file.display()
    );
    Ok(())
}

async fn cmd_restart_detached(
    config: &HistSyncConfig,
    config_path: &Path,
    log_level: Option<&str>,
    grace: Duration,
) -> Result<()> {
    build_strategy(config).context("failed to set up sync strategy")?;
    let command = background_command(config, config_path, log_level)?;
    let child = controller(config)
        .restart_detached(command, grace, DEFAULT_STARTUP_WAIT)
        .await?;
    println!("✓ Daemon restarted in background (PID {})", child.id());
    Ok(())
}

async fn cmd_restart(config: &HistSyncConfig, grace: Duration) -> Result<()> {
    let mut strategy = build_strategy(config).context("failed to set up sync strategy")?;
    let shutdown = signals::setup_signal_handlers().context("failed to install signal handlers")?;
    let state = controller(config)
        .restart(&mut strategy, grace, shutdown)
        .await?;
    println!(
        "Daemon exited after {} cycles ({} failed)",
        state.cycles, state.failures
    );
    Ok(())
}

/// Show daemon status.
fn cmd_status(config: &HistSyncConfig) -> Result<()> {
    match controller(config).status()? {
        Some(pid) => println!("● Running (PID {})", pid),
        None => println!("○ Not running"),
    }
    Ok(())
}
