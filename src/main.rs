// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Overwatch - Real-time Motion Monitoring Kernel
//!
//! Runs the coordinator by default. The hidden `worker` subcommand is how
//! the coordinator re-executes this binary as the detection worker.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use overwatch::capture::{run_worker, WorkerSettings};
use overwatch::{Config, Engine, VERSION};

/// Overwatch - Real-time Motion Monitoring Kernel
#[derive(Parser, Debug)]
#[command(name = "overwatch")]
#[command(author = "bad-antics")]
#[command(version = VERSION)]
#[command(about = "Supervised motion detection with alarm state machine and notifier fan-out")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Play a directory of frames instead of the camera
    #[arg(long)]
    file: Option<PathBuf>,

    /// Demo mode with a simulated camera
    #[arg(long)]
    demo: bool,

    /// Test mode, the capture schedule is disabled
    #[arg(long)]
    test: bool,

    /// Do not run any notifier
    #[arg(long)]
    silent: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace-level logging
    #[arg(long)]
    trace: bool,

    /// Explicit log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Mode>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Detection worker, started by the coordinator
    #[command(hide = true)]
    Worker,
}

impl Args {
    fn log_level(&self) -> Result<Level> {
        if let Some(level) = &self.log_level {
            return Level::from_str(level).map_err(|_| anyhow::anyhow!("unknown log level '{}'", level));
        }
        Ok(if self.trace {
            Level::TRACE
        } else if self.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Mode::Worker) = args.command {
        return worker_main();
    }

    let log_level = args.log_level()?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(args.debug)
        .with_line_number(args.debug)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Overwatch v{} - Real-time Motion Monitoring Kernel", VERSION);

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_create(&config_path)?;

    config.flags.config_path = Some(config_path.clone());
    config.flags.silent = args.silent;
    config.flags.test = args.test;
    config.flags.demo = args.demo;
    config.flags.file = args.file.clone();
    config.flags.log_level = log_level.to_string();

    info!("Configuration loaded from {:?}", config_path);
    info!("Demo mode: {}, test mode: {}, silent: {}", args.demo, args.test, args.silent);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(config.server.worker_threads)
        .build()
        .context("failed to build the runtime")?;

    let engine = Engine::new(config)?;
    let result = runtime.block_on(engine.run());
    runtime.shutdown_background();

    info!("Overwatch shutdown complete");
    result
}

/// The worker logs to stderr; stdout carries the wire protocol
fn worker_main() -> Result<()> {
    let settings = WorkerSettings::from_env()?;
    let level = Level::from_str(&settings.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Detection worker {} starting", std::process::id());
    run_worker(settings)
}
