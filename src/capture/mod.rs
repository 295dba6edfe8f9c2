//! Capture module - the detection worker process and its supervisor
//!
//! Everything below [`worker`] runs inside the child process. The coordinator
//! only ever touches the [`Supervisor`] and the wire types in [`protocol`].

pub mod imaging;
pub mod protocol;
pub mod source;
pub mod supervisor;
pub mod worker;

pub use protocol::{CaptureControl, WorkerHeartbeat, WorkerMessage};
pub use source::{CaptureError, CaptureSource};
pub use supervisor::{ProcessLauncher, Supervisor, SupervisorError, SupervisorService, WorkerHandle, WorkerLauncher};
pub use worker::{run_worker, WorkerSettings};

use serde::{Deserialize, Serialize};

/// Processing-time batch forwarded from a worker heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetrics {
    pub pid: u32,
    pub frame_processing_times: Vec<f64>,
}

impl From<&WorkerHeartbeat> for CaptureMetrics {
    fn from(heartbeat: &WorkerHeartbeat) -> Self {
        Self {
            pid: heartbeat.pid,
            frame_processing_times: heartbeat.frame_processing_times.clone(),
        }
    }
}
