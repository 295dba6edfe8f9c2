//! Metrics module - processing loop timing and process resource usage
//!
//! Each capture metrics batch from the worker is summarised together with
//! the CPU and memory usage of the coordinator and worker processes, then
//! published on [`Topic::SystemMetricsReady`].

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace};

use crate::capture::CaptureMetrics;
use crate::core::{BusError, Event, EventBus, Payload, Subscription, Topic};

/// Number of summaries kept for [`MetricsCollector::recent`]
const HISTORY_LEN: usize = 60;

/// Pending batches beyond this are dropped
const QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsData {
    pub timestamp: DateTime<Utc>,
    pub sys_cpu_percent: f32,
    pub sys_mem_percent: f32,
    pub cap_cpu_percent: f32,
    pub cap_mem_percent: f32,
    /// Seconds per processed frame
    pub loop_avg: f64,
    pub loop_max: f64,
    pub loop_min: f64,
}

/// Loop time (avg, max, min) of a batch, `None` when empty
pub fn loop_stats(times: &[f64]) -> Option<(f64, f64, f64)> {
    if times.is_empty() {
        return None;
    }
    let sum: f64 = times.iter().sum();
    let max = times.iter().copied().fold(f64::MIN, f64::max);
    let min = times.iter().copied().fold(f64::MAX, f64::min);
    Some((sum / times.len() as f64, max, min))
}

/// CPU and memory percent of the two processes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessUsage {
    pub sys_cpu: f32,
    pub sys_mem: f32,
    pub cap_cpu: f32,
    pub cap_mem: f32,
}

/// Source of process usage samples
pub trait UsageProbe: Send {
    fn sample(&mut self, worker_pid: u32) -> ProcessUsage;
}

/// `sysinfo` backed probe. Kept alive between samples so CPU usage has a
/// previous reading to diff against.
pub struct SysinfoProbe {
    system: System,
    own_pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            own_pid: sysinfo::get_current_pid().ok(),
        }
    }

    fn process_usage(&mut self, pid: Pid, total_memory: u64) -> (f32, f32) {
        if !self.system.refresh_process(pid) {
            return (0.0, 0.0);
        }
        match self.system.process(pid) {
            Some(process) => {
                let mem = if total_memory > 0 {
                    (process.memory() as f64 / total_memory as f64 * 100.0) as f32
                } else {
                    0.0
                };
                (process.cpu_usage(), mem)
            }
            None => (0.0, 0.0),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageProbe for SysinfoProbe {
    fn sample(&mut self, worker_pid: u32) -> ProcessUsage {
        self.system.refresh_memory();
        let total = self.system.total_memory();

        let (sys_cpu, sys_mem) = match self.own_pid {
            Some(pid) => self.process_usage(pid, total),
            None => (0.0, 0.0),
        };
        let (cap_cpu, cap_mem) = self.process_usage(Pid::from_u32(worker_pid), total);
        ProcessUsage {
            sys_cpu,
            sys_mem,
            cap_cpu,
            cap_mem,
        }
    }
}

/// Summarise one batch
pub fn summarise(batch: &CaptureMetrics, usage: ProcessUsage, timestamp: DateTime<Utc>) -> Option<MetricsData> {
    let (loop_avg, loop_max, loop_min) = loop_stats(&batch.frame_processing_times)?;
    Some(MetricsData {
        timestamp,
        sys_cpu_percent: usage.sys_cpu,
        sys_mem_percent: usage.sys_mem,
        cap_cpu_percent: usage.cap_cpu,
        cap_mem_percent: usage.cap_mem,
        loop_avg,
        loop_max,
        loop_min,
    })
}

pub struct MetricsCollector {
    bus: Arc<EventBus>,
    probe: Arc<Mutex<Box<dyn UsageProbe>>>,
    history: Arc<Mutex<VecDeque<MetricsData>>>,
    tx: mpsc::Sender<CaptureMetrics>,
    rx: Mutex<Option<mpsc::Receiver<CaptureMetrics>>>,
}

impl MetricsCollector {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_probe(bus, Box::new(SysinfoProbe::new()))
    }

    pub fn with_probe(bus: Arc<EventBus>, probe: Box<dyn UsageProbe>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        Self {
            bus,
            probe: Arc::new(Mutex::new(probe)),
            history: Arc::new(Mutex::new(VecDeque::with_capacity(HISTORY_LEN))),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Queue capture metrics batches from the bus
    pub fn subscribe(&self) -> Result<Subscription, BusError> {
        let tx = self.tx.clone();
        self.bus.subscribe_fn(Topic::CaptureMetricsUpdate, move |event| {
            if let Payload::CaptureMetrics(batch) = &event.data {
                if tx.try_send(batch.clone()).is_err() {
                    trace!("Metrics queue full, dropping batch");
                }
            }
        })
    }

    /// Most recent summaries, oldest first
    pub fn recent(&self) -> Vec<MetricsData> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<MetricsData> {
        self.history.lock().back().cloned()
    }

    /// Sample usage for `batch` on the blocking pool and publish the summary
    pub async fn process(&self, batch: CaptureMetrics) -> Result<Option<MetricsData>> {
        let probe = self.probe.clone();
        let pid = batch.pid;
        let usage = tokio::task::spawn_blocking(move || probe.lock().sample(pid)).await?;

        let Some(data) = summarise(&batch, usage, Utc::now()) else {
            debug!("Empty capture metrics batch from pid {}", batch.pid);
            return Ok(None);
        };

        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_LEN {
                history.pop_front();
            }
            history.push_back(data.clone());
        }
        self.bus
            .publish(Topic::SystemMetricsReady, Event::new(Payload::Metrics(data.clone())));
        Ok(Some(data))
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let Some(mut rx) = self.rx.lock().take() else {
            anyhow::bail!("metrics collector already running");
        };
        info!("Starting metrics collector...");
        loop {
            tokio::select! {
                batch = rx.recv() => match batch {
                    Some(batch) => {
                        self.process(batch).await?;
                    }
                    None => break,
                },
                _ = shutdown.recv() => {
                    info!("Metrics collector shutting down...");
                    break;
                }
            }
        }
        Ok(())
    }
}
