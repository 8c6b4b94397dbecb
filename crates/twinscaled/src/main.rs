//! twinscaled — the twinscale daemon.
//!
//! Watches a telemetry directory, decides per sensor whether its virtual
//! counterpart is still worth running, and drives the lifecycle backend
//! (in-memory dry run or external commands) accordingly.
//!
//! # Usage
//!
//! ```text
//! twinscaled run --config /etc/twinscale/twinscale.toml
//! twinscaled check-config --config twinscale.toml
//! twinscaled history --config twinscale.toml --sensor pump-1
//! ```

mod command_lifecycle;
mod daemon;
mod dir_source;
mod settings;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use twinscale_autoscale::controller::epoch_millis;
use twinscale_state::DecisionLog;

use crate::settings::{LifecycleMode, Settings};

const DEFAULT_FILTER: &str = "info,twinscaled=debug,twinscale=debug";

#[derive(Parser)]
#[command(name = "twinscaled", about = "Virtual sensor autoscaler daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop until interrupted.
    Run {
        /// Path to twinscale.toml.
        #[arg(long, default_value = "twinscale.toml")]
        config: PathBuf,

        /// Override `telemetry.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Force the in-memory lifecycle backend.
        #[arg(long)]
        dry_run: bool,

        /// Override `controller.tick_interval` (e.g. "10s").
        #[arg(long)]
        tick_interval: Option<String>,
    },
    /// Validate a configuration file and exit.
    CheckConfig {
        #[arg(long, default_value = "twinscale.toml")]
        config: PathBuf,
    },
    /// Print the effective configuration, defaults filled in.
    PrintConfig {
        /// Start from this file instead of the built-in defaults.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show recorded decisions for a sensor.
    History {
        #[arg(long, default_value = "twinscale.toml")]
        config: PathBuf,

        #[arg(long)]
        sensor: String,

        /// Most recent entries to show.
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            dry_run,
            tick_interval,
        } => {
            let mut settings = Settings::from_file(&config)?;
            if let Some(dir) = data_dir {
                settings.daemon.telemetry.data_dir = dir;
            }
            if dry_run {
                settings.daemon.lifecycle.mode = LifecycleMode::DryRun;
            }
            if let Some(interval) = tick_interval {
                settings.scaler.controller.tick_interval = interval;
            }
            settings.validate()?;
            run(settings).await
        }
        Command::CheckConfig { config } => {
            let settings = Settings::from_file(&config)?;
            println!(
                "{}: ok ({} operator sensors, lifecycle {:?})",
                config.display(),
                settings.daemon.sensors.len(),
                settings.daemon.lifecycle.mode
            );
            Ok(())
        }
        Command::PrintConfig { config } => {
            let settings = match config {
                Some(path) => Settings::from_file(&path)?,
                None => Settings::default(),
            };
            print!("{}", settings.to_toml_string()?);
            Ok(())
        }
        Command::History {
            config,
            sensor,
            limit,
        } => history(&config, &sensor, limit),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    info!("twinscale daemon starting");

    let daemon = daemon::build(&settings, epoch_millis()).await?;
    let mut controller = daemon.controller;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control_handle = tokio::spawn(async move {
        controller.run(shutdown_rx).await;
        controller
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let controller = control_handle.await.context("control loop panicked")?;
    let registry = controller.registry();
    info!(
        ticks = controller.ticks(),
        sensors = registry.len().await,
        degraded = registry.degraded().await.len(),
        "twinscale daemon stopped"
    );
    Ok(())
}

fn history(config: &Path, sensor: &str, limit: usize) -> anyhow::Result<()> {
    let settings = Settings::from_file(config)?;
    let Some(path) = settings.daemon.state.path else {
        anyhow::bail!("state.path is not set in {}", config.display());
    };
    let log = DecisionLog::open(&path)?;
    for entry in log.list_for_sensor(sensor, limit)? {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "twinscaled",
            "--log-json",
            "run",
            "--config",
            "t.toml",
            "--dry-run",
            "--tick-interval",
            "5s",
        ])
        .unwrap();
        assert!(cli.log_json);
        match cli.command {
            Command::Run {
                dry_run,
                tick_interval,
                ..
            } => {
                assert!(dry_run);
                assert_eq!(tick_interval.as_deref(), Some("5s"));
            }
            _ => panic!("expected run"),
        }
    }
}
