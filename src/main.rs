//! Command-line front end for a simulated beamline.
//!
//! # Configuration
//!
//! The beamline is built from, in order of priority:
//!
//! 1. `--config PATH`
//! 2. `<config dir>/rust_beamline/beamline.toml`
//! 3. `config/beamline.toml`
//!
//! with `BEAMLINE_*` environment variables overriding file values. `RUST_LOG`
//! overrides the configured log level.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_beamline::config::BeamlineConfig;
use rust_beamline::scan::ScanSpec;
use rust_beamline::traits::{Configurable, Pausable};
use rust_beamline::Beamline;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Drive a simulated beamline: sample changer and line scans
#[derive(Parser, Debug)]
#[command(name = "beamline")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the states of every device and engine
    Status,
    /// Mount the sample stored in PORT
    Mount {
        /// Port id, e.g. A1
        port: String,
        /// Automounter to use
        #[arg(long, default_value = "automounter")]
        automounter: String,
    },
    /// Return the mounted sample to its port
    Dismount {
        /// Mount this port first
        #[arg(long)]
        after_mounting: Option<String>,
        /// Automounter to use
        #[arg(long, default_value = "automounter")]
        automounter: String,
    },
    /// Run a line scan and save the record
    Scan {
        /// Scan engine (defaults to the first configured scan)
        #[arg(long)]
        name: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        start: f64,
        #[arg(long, allow_hyphen_values = true)]
        end: f64,
        #[arg(long)]
        steps: usize,
        /// Counting time per point, in seconds
        #[arg(long, default_value_t = 0.1)]
        dwell: f64,
        /// Output directory (defaults to storage.output_dir)
        #[arg(long, value_name = "DIR")]
        output: Option<PathBuf>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => BeamlineConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BeamlineConfig::load().context("loading default configuration")?,
    };
    init_tracing(&config.beamline.log_level);

    let beamline = Beamline::from_config(&config)?;
    let outcome = run(&beamline, &config, args.command).await;
    if let Err(e) = beamline.cleanup().await {
        warn!(error = %e, "shutdown incomplete");
    }
    outcome
}

async fn run(beamline: &Beamline, config: &BeamlineConfig, command: Command) -> Result<()> {
    match command {
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&beamline.status())?);
        }
        Command::Mount { port, automounter } => {
            let mounter = beamline.automounter(&automounter)?;
            mounter.prepare().await?;
            let outcome = mounter.mount(&port).await?;
            println!("{outcome:?}");
        }
        Command::Dismount {
            after_mounting,
            automounter,
        } => {
            let mounter = beamline.automounter(&automounter)?;
            mounter.prepare().await?;
            if let Some(port) = after_mounting {
                mounter.mount(&port).await?;
            }
            let outcome = mounter.dismount().await?;
            println!("{outcome:?}");
        }
        Command::Scan {
            name,
            start,
            end,
            steps,
            dwell,
            output,
        } => {
            let name = name
                .or_else(|| config.scans.first().map(|s| s.name.clone()))
                .context("no scan configured")?;
            let scan = beamline.scan(&name)?;
            let mut spec = scan
                .spec()
                .unwrap_or_else(|| ScanSpec::new(start, end, steps, Duration::ZERO));
            spec.start = start;
            spec.end = end;
            spec.steps = steps;
            spec.dwell = Duration::try_from_secs_f64(dwell).context("invalid dwell time")?;
            scan.configure(spec)?;

            let acquisition = scan.scan();
            tokio::pin!(acquisition);
            let outcome = tokio::select! {
                outcome = &mut acquisition => outcome,
                _ = tokio::signal::ctrl_c() => {
                    warn!(scan = %name, "interrupted, stopping at the next point");
                    scan.stop();
                    acquisition.await
                }
            };

            if scan.result().is_some() {
                let directory = output.unwrap_or_else(|| config.storage.output_dir.clone());
                let path = scan.save(&directory)?;
                println!("saved {}", path.display());
            }
            let result = outcome?;
            info!(scan = %name, points = result.len(), status = %result.header.status, "scan done");
            println!("{} points, {}", result.len(), result.header.status);
        }
    }
    Ok(())
}
