// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Detection worker supervisor
//!
//! Owns the worker process and its three channels, republishes what the
//! worker sends onto the bus and restarts the worker when its heartbeat goes
//! quiet for longer than [`WATCHDOG_TIMEOUT`]. A running worker is never
//! reconfigured in place: config changes tear it down and spawn a new one.

use std::io::{BufReader, BufWriter};
use std::process::{ChildStdin, ChildStdout};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::protocol::{read_message, write_message, CaptureControl, ProtocolError, WorkerHeartbeat, WorkerMessage};
use super::worker::{WorkerSettings, SETTINGS_ENV};
use super::CaptureMetrics;
use crate::config::Config;
use crate::core::{Event, EventBus, Payload, Subscription, Topic};

/// Heartbeat silence after which the worker is presumed dead
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinator polling period
pub const POLL_INTERVAL: Duration = Duration::from_millis(33);

/// Sensitivity sent with every control message
pub const DEFAULT_SENSITIVITY: u8 = 50;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn detection worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker settings could not be encoded: {0}")]
    Settings(#[from] serde_json::Error),

    #[error("detection worker has no {0} pipe")]
    MissingPipe(&'static str),
}

/// Coordinator side of one running worker
pub trait WorkerHandle: Send {
    fn pid(&self) -> u32;

    fn send_control(&mut self, control: CaptureControl) -> Result<(), ProtocolError>;

    /// Newest unread heartbeat, without blocking
    fn try_recv_heartbeat(&mut self) -> Option<WorkerHeartbeat>;

    /// Newest unread preview frame, without blocking
    fn try_recv_frame(&mut self) -> Option<Vec<u8>>;

    /// Ask the worker to stop, wait up to `grace`, then force it
    fn shutdown(&mut self, grace: Duration);
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, settings: &WorkerSettings) -> Result<Box<dyn WorkerHandle>, SupervisorError>;
}

/// Launches the worker by re-executing this binary with the `worker` subcommand
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("cannot locate own executable")?;
        Ok(Self::new(program))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, settings: &WorkerSettings) -> Result<Box<dyn WorkerHandle>, SupervisorError> {
        let settings_json = serde_json::to_string(settings)?;
        let mut child = Command::new(&self.program)
            .arg("worker")
            .env(SETTINGS_ENV, settings_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let stdin = child.stdin.take().ok_or(SupervisorError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SupervisorError::MissingPipe("stdout"))?;
        let pid = child.id();

        let (heartbeat_tx, heartbeats) = channel::bounded(1);
        let (frame_tx, frames) = channel::bounded(1);
        let demux = Demux {
            heartbeat_tx,
            heartbeat_drain: heartbeats.clone(),
            frame_tx,
            frame_drain: frames.clone(),
        };

        let reader = std::thread::Builder::new()
            .name(format!("worker-{}-reader", pid))
            .spawn(move || demux.run(stdout));
        if let Err(e) = reader {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SupervisorError::Spawn(e));
        }

        info!("Detection worker started with pid {}", pid);
        Ok(Box::new(ProcessWorker {
            child,
            stdin: Some(BufWriter::new(stdin)),
            heartbeats,
            frames,
            reaped: false,
        }))
    }
}

/// Splits the worker's stdout into the heartbeat and frame channels.
/// Each channel holds one item; a newer item replaces an unread one.
struct Demux {
    heartbeat_tx: Sender<WorkerHeartbeat>,
    heartbeat_drain: Receiver<WorkerHeartbeat>,
    frame_tx: Sender<Vec<u8>>,
    frame_drain: Receiver<Vec<u8>>,
}

impl Demux {
    fn run(self, stdout: ChildStdout) {
        let mut reader = BufReader::new(stdout);
        loop {
            let delivered = match read_message::<_, WorkerMessage>(&mut reader) {
                Ok(Some(WorkerMessage::Heartbeat(h))) => offer(&self.heartbeat_tx, &self.heartbeat_drain, h),
                Ok(Some(WorkerMessage::Frame(f))) => offer(&self.frame_tx, &self.frame_drain, f),
                Ok(None) => break,
                Err(e) => {
                    warn!("Dropping worker stream: {}", e);
                    break;
                }
            };
            if !delivered {
                break;
            }
        }
        debug!("Worker output stream closed");
    }
}

/// Returns false once the coordinator side is gone
fn offer<T>(tx: &Sender<T>, drain: &Receiver<T>, item: T) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Full(item)) => {
            let _ = drain.try_recv();
            !matches!(tx.try_send(item), Err(TrySendError::Disconnected(_)))
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

struct ProcessWorker {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    heartbeats: Receiver<WorkerHeartbeat>,
    frames: Receiver<Vec<u8>>,
    reaped: bool,
}

impl ProcessWorker {
    #[cfg(unix)]
    fn terminate(&self) {
        // SAFETY: plain signal delivery to a pid we spawned and have not reaped
        let rc = unsafe { libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!("SIGTERM to worker {} failed: {}", self.child.id(), std::io::Error::last_os_error());
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {}
}

impl WorkerHandle for ProcessWorker {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn send_control(&mut self, control: CaptureControl) -> Result<(), ProtocolError> {
        match self.stdin.as_mut() {
            Some(stdin) => write_message(stdin, &control),
            None => Err(ProtocolError::Io(std::io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn try_recv_heartbeat(&mut self) -> Option<WorkerHeartbeat> {
        self.heartbeats.try_recv().ok()
    }

    fn try_recv_frame(&mut self) -> Option<Vec<u8>> {
        self.frames.try_recv().ok()
    }

    fn shutdown(&mut self, grace: Duration) {
        if self.reaped {
            return;
        }
        let pid = self.child.id();
        self.stdin.take();
        self.terminate();

        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Detection worker {} exited with {}", pid, status);
                    self.reaped = true;
                    return;
                }
                Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(50)),
                Ok(None) => break,
                Err(e) => {
                    warn!("Could not query worker {}: {}", pid, e);
                    break;
                }
            }
        }

        warn!("Detection worker {} ignored termination, killing it", pid);
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Watchdog and channel polling for one worker slot.
///
/// Time is passed in explicitly so the watchdog can be driven by tests.
pub struct Supervisor {
    launcher: Arc<dyn WorkerLauncher>,
    settings: WorkerSettings,
    worker: Option<Box<dyn WorkerHandle>>,
    last_heartbeat: Instant,
    capture_stopped: bool,
    grace: Duration,
    watchdog_timeout: Duration,
    restarts: u64,
}

impl Supervisor {
    pub fn start(launcher: Arc<dyn WorkerLauncher>, config: &Config, now: Instant) -> Result<Self, SupervisorError> {
        let mut supervisor = Self {
            launcher,
            settings: WorkerSettings::from_config(config),
            worker: None,
            last_heartbeat: now,
            capture_stopped: false,
            grace: Duration::from_secs(config.server.shutdown_grace_secs),
            watchdog_timeout: WATCHDOG_TIMEOUT,
            restarts: 0,
        };
        supervisor.spawn(now)?;
        Ok(supervisor)
    }

    fn spawn(&mut self, now: Instant) -> Result<(), SupervisorError> {
        let mut worker = self.launcher.launch(&self.settings)?;
        if self.capture_stopped {
            if let Err(e) = worker.send_control(self.control()) {
                warn!("Could not pause new worker: {}", e);
            }
        }
        self.worker = Some(worker);
        self.last_heartbeat = now;
        Ok(())
    }

    fn control(&self) -> CaptureControl {
        CaptureControl {
            stop_processing: self.capture_stopped,
            sensitivity: DEFAULT_SENSITIVITY,
        }
    }

    /// Read at most one frame and one heartbeat, then check the watchdog.
    /// Returns the events to publish.
    pub fn poll(&mut self, now: Instant) -> Result<Vec<(Topic, Event)>, SupervisorError> {
        if self.worker.is_none() {
            self.spawn(now)?;
        }

        let mut events = Vec::new();
        if let Some(worker) = self.worker.as_mut() {
            if let Some(frame) = worker.try_recv_frame() {
                events.push((Topic::VideoRawUpdate, Event::new(Payload::RawFrame(Arc::new(frame)))));
            }
            if let Some(heartbeat) = worker.try_recv_heartbeat() {
                events.push((
                    Topic::CaptureMetricsUpdate,
                    Event::new(Payload::CaptureMetrics(CaptureMetrics::from(&heartbeat))),
                ));
                events.push((
                    Topic::CaptureDetectionUpdate,
                    Event::new(Payload::Detection(heartbeat.motion_detected)),
                ));
                self.last_heartbeat = now;
            }
        }

        if now.saturating_duration_since(self.last_heartbeat) > self.watchdog_timeout {
            error!("The watchdog timer expired for the detection worker, restarting it");
            self.restart(now)?;
        }
        Ok(events)
    }

    /// Tear down the current worker and spawn a fresh one
    pub fn restart(&mut self, now: Instant) -> Result<(), SupervisorError> {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown(self.grace);
        }
        self.restarts += 1;
        self.spawn(now)
    }

    pub fn update_config(&mut self, config: &Config, now: Instant) -> Result<(), SupervisorError> {
        debug!("Updating detection worker config");
        self.settings = WorkerSettings::from_config(config);
        self.grace = Duration::from_secs(config.server.shutdown_grace_secs);
        self.restart(now)
    }

    /// Pause or resume detection. Survives worker restarts.
    pub fn set_capture_stopped(&mut self, stopped: bool) {
        self.capture_stopped = stopped;
        let control = self.control();
        if let Some(worker) = self.worker.as_mut() {
            if let Err(e) = worker.send_control(control) {
                warn!("Could not send control to worker {}: {}", worker.pid(), e);
            }
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            info!("Stopping detection worker {}", worker.pid());
            worker.shutdown(self.grace);
        }
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().map(|w| w.pid())
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn capture_stopped(&self) -> bool {
        self.capture_stopped
    }
}

/// Changes requested through the bus, applied on the next poll
#[derive(Default)]
struct Pending {
    config: Option<Arc<Config>>,
    capture_stop: Option<bool>,
}

/// Bus-facing wrapper running the supervisor polling loop.
///
/// Poll work, including worker teardown, runs on the blocking pool; events
/// are published back on the coordinating task.
pub struct SupervisorService {
    supervisor: Arc<Mutex<Supervisor>>,
    pending: Arc<Mutex<Pending>>,
    bus: Arc<EventBus>,
    subscriptions: Vec<Subscription>,
}

impl SupervisorService {
    pub fn new(supervisor: Supervisor, bus: Arc<EventBus>) -> Result<Self> {
        let pending = Arc::new(Mutex::new(Pending::default()));
        let mut subscriptions = Vec::new();

        let slot = pending.clone();
        subscriptions.push(bus.subscribe_fn(Topic::SystemConfigUpdate, move |event| {
            if let Payload::Config(config) = &event.data {
                slot.lock().config = Some(config.clone());
            }
        })?);

        let slot = pending.clone();
        subscriptions.push(bus.subscribe_fn(Topic::SchedulerCaptureStop, move |event| {
            if let Payload::CaptureStop(stop) = event.data {
                slot.lock().capture_stop = Some(stop);
            }
        })?);

        Ok(Self {
            supervisor: Arc::new(Mutex::new(supervisor)),
            pending,
            bus,
            subscriptions,
        })
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("Starting detection supervisor...");
        let mut ticker = interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for (topic, event) in self.poll_once().await? {
                        self.bus.publish(topic, event);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Detection supervisor shutting down...");
                    break;
                }
            }
        }
        self.stop().await
    }

    async fn poll_once(&self) -> Result<Vec<(Topic, Event)>> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let supervisor = self.supervisor.clone();
        let events = tokio::task::spawn_blocking(move || {
            let mut supervisor = supervisor.lock();
            if let Some(stop) = pending.capture_stop {
                if stop != supervisor.capture_stopped() {
                    supervisor.set_capture_stopped(stop);
                }
            }
            if let Some(config) = pending.config {
                supervisor.update_config(&config, Instant::now())?;
            }
            supervisor.poll(Instant::now())
        })
        .await
        .context("supervisor poll panicked")??;
        Ok(events)
    }

    /// Stop the worker, waiting out its grace period
    pub async fn stop(&self) -> Result<()> {
        let supervisor = self.supervisor.clone();
        tokio::task::spawn_blocking(move || supervisor.lock().shutdown())
            .await
            .context("worker shutdown panicked")
    }
}

impl Drop for SupervisorService {
    fn drop(&mut self) {
        self.bus.release(self.subscriptions.drain(..));
    }
}
