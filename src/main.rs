#![forbid(unsafe_code)]

//! `pimd-orchestrator` — console front end for one PIMD session.
//!
//! Collects the working directory and simulation parameters from the
//! command line, runs the coordinator/worker pair, prints the merged
//! session log, and stops the session on Ctrl-C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pimd_orchestrator::config::SupervisorConfig;
use pimd_orchestrator::models::log::{LogRecord, SessionEvent};
use pimd_orchestrator::models::params::{DynamicsMode, SimulationParams, ThermostatMode};
use pimd_orchestrator::models::session::SessionState;
use pimd_orchestrator::orchestrator::Orchestrator;
use pimd_orchestrator::render::ipi::IpiInputRenderer;
use pimd_orchestrator::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "pimd-orchestrator",
    about = "Run an i-PI + LAMMPS path-integral MD session",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file; built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Diagnostic log format (text or json), written to stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print session records as JSON lines instead of text.
    #[arg(long)]
    json: bool,

    /// Working directory name, created under `sessions_root`.
    #[arg(long, default_value = "pimd_run_1")]
    workdir: String,

    /// Temperature (K).
    #[arg(long, default_value_t = 300.0)]
    temperature: f64,

    /// Number of beads.
    #[arg(long, default_value_t = 32)]
    nbeads: u32,

    /// Timestep (fs).
    #[arg(long, default_value_t = 0.5)]
    timestep: f64,

    /// Total steps.
    #[arg(long, default_value_t = 80_000)]
    total_steps: u64,

    /// Output stride.
    #[arg(long, default_value_t = 100)]
    stride: u64,

    /// Thermostat tau (fs).
    #[arg(long, default_value_t = 100.0)]
    tau: f64,

    /// Dynamics mode: nvt, npt or nve.
    #[arg(long, default_value_t = DynamicsMode::Nvt)]
    dynamics: DynamicsMode,

    /// Thermostat mode: langevin, pile_g, pile_l, svr or ggmt.
    #[arg(long, default_value_t = ThermostatMode::Langevin)]
    thermostat: ThermostatMode,
}

impl Cli {
    fn params(&self) -> SimulationParams {
        SimulationParams {
            temperature: self.temperature,
            nbeads: self.nbeads,
            timestep: self.timestep,
            total_steps: self.total_steps,
            stride: self.stride,
            tau: self.tau,
            dynamics: self.dynamics,
            thermostat: self.thermostat,
        }
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("pimd-orchestrator bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match &args.config {
        Some(path) => SupervisorConfig::load_from_path(path)?,
        None => SupervisorConfig::default(),
    };
    info!(endpoint = %config.endpoint_path().display(), "configuration loaded");

    // ── Presentation: print records as they arrive ──────
    let (tx, mut rx) = mpsc::unbounded_channel();
    let json = args.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let SessionEvent::Record(record) = event {
                print_record(&record, json);
            }
        }
    });

    let orchestrator = Orchestrator::new(Arc::new(config), Arc::new(IpiInputRenderer))
        .with_observer(tx);

    let outcome = match orchestrator.start(&args.workdir, args.params()).await {
        Ok(session) => {
            let terminal = tokio::select! {
                state = session.wait_terminal() => state,
                () = shutdown_signal() => {
                    info!("shutdown signal received");
                    session.stop().await
                }
            };
            info!(state = %terminal, "session finished");
            match session.failure() {
                Some(err) if terminal == SessionState::Failed => Err(err),
                _ => Ok(()),
            }
        }
        Err(err) => {
            error!(%err, "session failed to start");
            Err(err)
        }
    };

    // Sessions hold observer senders; release them so the printer can finish.
    drop(orchestrator);
    join_printer(printer, Duration::from_secs(1)).await;
    outcome
}

/// Wait for the record printer, warning when it fails or overruns `limit`.
/// Returns whether it finished cleanly.
async fn join_printer(printer: JoinHandle<()>, limit: Duration) -> bool {
    match tokio::time::timeout(limit, printer).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(%err, "record printer task failed");
            false
        }
        Err(_) => {
            warn!(?limit, "record printer did not finish in time");
            false
        }
    }
}

fn print_record(record: &LogRecord, json: bool) {
    if json {
        match serde_json::to_string(record) {
            Ok(line) => println!("{line}"),
            Err(err) => error!(%err, "failed to serialize record"),
        }
    } else {
        let time = record.timestamp.with_timezone(&Local).format("%H:%M:%S");
        println!("[{time}] [{}] {}", record.source, record.text);
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
