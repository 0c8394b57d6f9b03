//! CLI entry point for heap-daq
//!
//! Provides:
//! - `run`: the controller. Listens for START/STOP/QUIT on the command FIFO (and
//!   standard input), launching and tearing down the stage chain.
//! - `send`: writes one control line to a running controller.
//!
//! # Usage
//!
//! ```bash
//! heap-daq run --config config/heap_daq.toml --autostart
//! heap-daq send stop
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use heap_daq::command::{send_command, Command, CommandChannel};
use heap_daq::config::{CommandConfig, DaqConfig};
use heap_daq::error::{AppResult, DaqError};
use heap_daq::logging::{self, OutputFormat, TracingConfig};
use heap_daq::pipeline::orchestrator::PipelineSummary;
use heap_daq::pipeline::{CancelToken, Orchestrator, PipelineState, RunningPipeline};
use std::path::PathBuf;
use std::thread;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "heap-daq")]
#[command(about = "Heap ingest, accumulation and spectrum writing pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller
    Run {
        /// Configuration file (default: config/heap_daq.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Start the pipeline without waiting for START
        #[arg(long)]
        autostart: bool,

        /// Do not read commands from standard input
        #[arg(long)]
        no_stdin: bool,
    },

    /// Send a command (start, stop, quit) to a running controller
    Send {
        /// Command to send
        command: Command,

        /// Command FIFO (default: /tmp/heap_daq_control)
        #[arg(long)]
        fifo: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            autostart,
            no_stdin,
        } => run_controller(config, autostart, !no_stdin),
        Commands::Send { command, fifo } => send(command, fifo),
    };

    if let Err(e) = result {
        if e.is_fatal() {
            error!(error = %e, "Fatal error, exiting");
            std::process::exit(1);
        }
        return Err(e.into());
    }
    Ok(())
}

fn run_controller(config_path: Option<PathBuf>, autostart: bool, with_stdin: bool) -> AppResult<()> {
    let config = match config_path {
        Some(path) => DaqConfig::load_from(path)?,
        None => DaqConfig::load()?,
    };
    logging::init_from_config(&config)?;
    config.validate()?;
    info!(
        name = %config.application.name,
        mode = ?config.pipeline.bandwidth_mode,
        "Controller starting"
    );

    let state = PipelineState::new(CancelToken::new(), config.poll_interval());
    spawn_signal_listener(state.cancel_token().clone())?;

    let mut channel = CommandChannel::open(&config.command.fifo_path, with_stdin)?
        .with_timeout(config.poll_interval());
    let orchestrator = Orchestrator::new(config);

    let mut pipeline = if autostart {
        start_pipeline(&orchestrator)?
    } else {
        None
    };

    while state.should_run() {
        match channel.recv() {
            Command::Start if pipeline.is_some() => warn!("START ignored, pipeline already running"),
            Command::Start => pipeline = start_pipeline(&orchestrator)?,
            Command::Stop => match pipeline.take() {
                Some(running) => report(running.shutdown()),
                None => info!("STOP ignored, pipeline not running"),
            },
            Command::Quit => {
                info!("QUIT received");
                break;
            }
            Command::Invalid => {}
        }

        if pipeline.as_ref().is_some_and(RunningPipeline::is_finished) {
            info!("Terminal stage finished, tearing down pipeline");
            if let Some(running) = pipeline.take() {
                report(running.shutdown());
            }
        }
    }

    if let Some(running) = pipeline.take() {
        report(running.shutdown());
    }
    info!("Controller exiting");
    Ok(())
}

/// Start a chain. Fatal failures propagate; anything else leaves the controller
/// idle and waiting for the next command.
fn start_pipeline(orchestrator: &Orchestrator) -> AppResult<Option<RunningPipeline>> {
    match orchestrator.start() {
        Ok(running) => Ok(Some(running)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            error!(error = %e, "Pipeline failed to start");
            Ok(None)
        }
    }
}

fn report(summary: PipelineSummary) {
    for stage in &summary.stages {
        info!(
            stage = %stage.stage,
            outcome = ?stage.outcome,
            blocks_in = stage.stats.blocks_in,
            blocks_out = stage.stats.blocks_out,
            dropped = stage.stats.dropped,
            spectra = stage.stats.spectra,
            "Stage summary"
        );
    }
    for (id, ring) in &summary.rings {
        info!(
            buffer_id = id,
            published = ring.published,
            dropped = ring.dropped,
            drop_fraction = ring.drop_fraction(),
            "Ring summary"
        );
    }
}

/// Cancel `shutdown` on Ctrl-C.
fn spawn_signal_listener(shutdown: CancelToken) -> AppResult<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;
    thread::Builder::new()
        .name("heap-daq-signal".into())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Ctrl-C received, shutting down");
                        shutdown.cancel();
                    }
                    Err(e) => warn!(error = %e, "Could not listen for Ctrl-C"),
                }
            })
        })
        .map_err(DaqError::Io)?;
    Ok(())
}

fn send(command: Command, fifo: Option<PathBuf>) -> AppResult<()> {
    logging::init(TracingConfig::new(Level::INFO).with_format(OutputFormat::Compact))?;
    let path = fifo.unwrap_or_else(|| CommandConfig::default().fifo_path);
    send_command(&path, command)?;
    info!(%command, ?path, "Command sent");
    Ok(())
}
