// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Detection worker - the isolated child process running capture and the
//! motion decision engine
//!
//! The binary re-executes itself with the `worker` subcommand. Settings
//! arrive as JSON in [`SETTINGS_ENV`]; control messages are read from stdin
//! and heartbeats plus preview frames are written to stdout.

use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, TryRecvError};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::imaging;
use super::protocol::{read_message, write_message, CaptureControl, ProtocolError, WorkerHeartbeat, WorkerMessage};
use super::source::{CaptureError, CaptureSource, FrameDirectory, SimulatedCamera, SnapshotCamera};
use crate::config::Config;
use crate::detection::MotionDetector;

/// Environment variable carrying [`WorkerSettings`]
pub const SETTINGS_ENV: &str = "OVERWATCH_WORKER_SETTINGS";

/// Pause before reopening an unreachable source
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Minimum spacing of heartbeats
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Frame rate used when playing back a frame directory
const PLAYBACK_FPS: u32 = 15;

/// Everything the worker needs, including the flags `Config` never serializes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub config: Config,
    pub demo: bool,
    pub file: Option<PathBuf>,
    pub log_level: String,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            config: config.clone(),
            demo: config.flags.demo,
            file: config.flags.file.clone(),
            log_level: config.flags.log_level.clone(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(SETTINGS_ENV).with_context(|| format!("{} is not set", SETTINGS_ENV))?;
        serde_json::from_str(&raw).context("worker settings are not valid JSON")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("worker settings could not be serialized")
    }
}

/// Pick the capture source the settings ask for
pub fn init_capture_source(settings: &WorkerSettings) -> Box<dyn CaptureSource> {
    let width = settings.config.processing.frame_width;
    if settings.demo {
        debug!("Using simulated camera");
        Box::new(SimulatedCamera::new(width, width * 3 / 4, PLAYBACK_FPS))
    } else if let Some(dir) = &settings.file {
        debug!("Loading frames from {:?}", dir);
        Box::new(FrameDirectory::new(dir, PLAYBACK_FPS))
    } else {
        debug!("Running camera from {}", settings.config.camera.url);
        Box::new(SnapshotCamera::new(
            &settings.config.camera.url,
            Duration::from_millis(settings.config.camera.snapshot_interval_ms),
        ))
    }
}

/// Why the worker loop stopped
#[derive(Debug, Error)]
pub enum WorkerExit {
    #[error("control channel closed")]
    ControlClosed,

    #[error("output channel failed: {0}")]
    Output(#[from] ProtocolError),
}

enum StepError {
    Capture(CaptureError),
    Exit(WorkerExit),
}

impl From<CaptureError> for StepError {
    fn from(e: CaptureError) -> Self {
        StepError::Capture(e)
    }
}

impl From<WorkerExit> for StepError {
    fn from(e: WorkerExit) -> Self {
        StepError::Exit(e)
    }
}

pub struct DetectionWorker<W: Write> {
    detector: MotionDetector,
    frame_width: u32,
    gauss_ksize: u32,
    process_interval: Duration,
    running: bool,
    sensitivity: u8,
    motion_detected: bool,
    last_process: Option<Instant>,
    last_heartbeat: Option<Instant>,
    process_times: Vec<f64>,
    control: Receiver<CaptureControl>,
    out: W,
}

impl<W: Write> DetectionWorker<W> {
    pub fn new(config: &Config, control: Receiver<CaptureControl>, out: W) -> Self {
        Self {
            detector: MotionDetector::new(config),
            frame_width: config.processing.frame_width,
            gauss_ksize: config.processing.gauss_ksize,
            process_interval: Duration::from_secs(1) / config.processing.fps.max(1),
            running: true,
            sensitivity: 0,
            motion_detected: false,
            last_process: None,
            last_heartbeat: None,
            process_times: Vec::new(),
            control,
            out,
        }
    }

    /// Capture forever, reopening the source after capture failures.
    /// Only a closed control or output channel ends the loop.
    pub fn run(&mut self, source: &mut dyn CaptureSource) -> WorkerExit {
        info!("Starting detection on {}", source.describe());
        loop {
            match self.capture(source) {
                Err(StepError::Exit(reason)) => return reason,
                Err(StepError::Capture(CaptureError::Connection(msg))) => {
                    warn!("Connection error, resetting: {}", msg);
                    std::thread::sleep(RECONNECT_BACKOFF);
                }
                Err(StepError::Capture(e)) => {
                    debug!("Capture error, restarting capture: {}", e);
                }
                Ok(()) => {}
            }
        }
    }

    fn capture(&mut self, source: &mut dyn CaptureSource) -> Result<(), StepError> {
        source.open()?;
        loop {
            let img = source.next_frame()?;
            self.process_frame(&img)?;
        }
    }

    /// Preview, maybe decide, drain one control message, maybe heartbeat
    pub fn process_frame(&mut self, img: &DynamicImage) -> Result<(), WorkerExit> {
        let start = Instant::now();
        let gray = imaging::preprocess(img, self.frame_width);

        match imaging::encode_jpeg(&gray, imaging::PREVIEW_JPEG_QUALITY) {
            Ok(jpeg) => write_message(&mut self.out, &WorkerMessage::Frame(jpeg))?,
            Err(e) => debug!("Preview encode failed: {}", e),
        }

        if self.running {
            if self.decision_due(start) {
                let blurred = imaging::gaussian_blur(&gray, self.gauss_ksize);
                self.motion_detected = self.detector.update(&imaging::to_frame(&blurred));
                self.last_process = Some(start);
            }
        } else {
            self.motion_detected = false;
        }

        self.check_for_messages()?;
        self.process_times.push(start.elapsed().as_secs_f64());
        self.send_heartbeat()?;
        Ok(())
    }

    fn decision_due(&self, now: Instant) -> bool {
        self.last_process
            .map_or(true, |last| now.duration_since(last) >= self.process_interval)
    }

    fn check_for_messages(&mut self) -> Result<(), WorkerExit> {
        match self.control.try_recv() {
            Ok(msg) => {
                if self.running == msg.stop_processing {
                    debug!("Detection running set to {}", !msg.stop_processing);
                }
                self.running = !msg.stop_processing;
                self.sensitivity = msg.sensitivity;
                Ok(())
            }
            Err(TryRecvError::Empty) => Ok(()),
            Err(TryRecvError::Disconnected) => Err(WorkerExit::ControlClosed),
        }
    }

    fn send_heartbeat(&mut self) -> Result<(), WorkerExit> {
        let due = self
            .last_heartbeat
            .map_or(true, |last| last.elapsed() >= HEARTBEAT_INTERVAL);
        if !due {
            return Ok(());
        }

        let heartbeat = WorkerHeartbeat {
            pid: std::process::id(),
            running: self.running,
            motion_detected: self.motion_detected,
            frame_processing_times: std::mem::take(&mut self.process_times),
        };
        write_message(&mut self.out, &WorkerMessage::Heartbeat(heartbeat))?;
        self.last_heartbeat = Some(Instant::now());
        Ok(())
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn sensitivity(&self) -> u8 {
        self.sensitivity
    }
}

/// Ctrl-C goes to the whole process group. The coordinator owns shutdown
/// and stops the worker itself, so the worker must not die first.
#[cfg(unix)]
fn ignore_interrupts() -> libc::sighandler_t {
    // SAFETY: SIG_IGN installs no handler code
    let previous = unsafe { libc::signal(libc::SIGINT, libc::SIG_IGN) };
    if previous == libc::SIG_ERR {
        warn!("Could not ignore SIGINT: {}", io::Error::last_os_error());
    }
    previous
}

#[cfg(not(unix))]
fn ignore_interrupts() {}

/// Entry point of the `worker` subcommand
pub fn run_worker(settings: WorkerSettings) -> Result<()> {
    ignore_interrupts();
    let (control_tx, control_rx) = channel::unbounded();

    std::thread::Builder::new()
        .name("control-reader".to_string())
        .spawn(move || {
            let mut stdin = BufReader::new(io::stdin());
            loop {
                match read_message::<_, CaptureControl>(&mut stdin) {
                    Ok(Some(msg)) => {
                        if control_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Bad control message: {}", e);
                        break;
                    }
                }
            }
        })
        .context("failed to spawn control reader")?;

    let mut source = init_capture_source(&settings);
    let stdout = BufWriter::new(io::stdout().lock());
    let mut worker = DetectionWorker::new(&settings.config, control_rx, stdout);

    let reason = worker.run(source.as_mut());
    info!("Detection worker exiting: {}", reason);
    Ok(())
}
