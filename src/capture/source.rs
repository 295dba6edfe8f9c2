// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Capture sources - snapshot cameras, frame directories and a simulator

use std::f64::consts::PI;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::{DynamicImage, GrayImage, Luma};
use rand::prelude::*;
use rand_distr::StandardNormal;
use thiserror::Error;
use tracing::debug;

/// Capture failures. Both kinds are recovered inside the worker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Source unreachable or could not be opened
    #[error("capture source unavailable: {0}")]
    Connection(String),

    /// A frame was dropped or could not be decoded
    #[error("frame capture failed: {0}")]
    Frame(String),

    /// A finite source ran out of frames
    #[error("end of stream")]
    EndOfStream,
}

/// A sequence of raw images
pub trait CaptureSource: Send {
    /// Human readable description for logs
    fn describe(&self) -> String;

    /// (Re)open the source, rewinding finite ones
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Block until the next image is available
    fn next_frame(&mut self) -> Result<DynamicImage, CaptureError>;
}

/// Sleep until `interval` has passed since `last`, then stamp `last`
fn pace(last: &mut Option<Instant>, interval: Duration) {
    if let Some(previous) = *last {
        let elapsed = previous.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }
    *last = Some(Instant::now());
}

/// IP camera exposing a still image per HTTP request
pub struct SnapshotCamera {
    url: String,
    interval: Duration,
    client: Option<reqwest::blocking::Client>,
    last_frame: Option<Instant>,
}

impl SnapshotCamera {
    pub fn new(url: &str, interval: Duration) -> Self {
        Self {
            url: url.to_string(),
            interval,
            client: None,
            last_frame: None,
        }
    }
}

impl CaptureSource for SnapshotCamera {
    fn describe(&self) -> String {
        format!("camera at {}", self.url)
    }

    fn open(&mut self) -> Result<(), CaptureError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| CaptureError::Connection(e.to_string()))?;
        self.client = Some(client);
        self.last_frame = None;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<DynamicImage, CaptureError> {
        pace(&mut self.last_frame, self.interval);
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| CaptureError::Connection("camera not opened".to_string()))?;

        let body = client
            .get(&self.url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.bytes())
            .map_err(|e| CaptureError::Connection(format!("couldn't reach camera at {}: {}", self.url, e)))?;

        image::load_from_memory(&body).map_err(|e| CaptureError::Frame(e.to_string()))
    }
}

/// Plays a directory of still images in name order, like a looping video file
pub struct FrameDirectory {
    dir: PathBuf,
    frame_interval: Duration,
    files: Vec<PathBuf>,
    position: usize,
    last_frame: Option<Instant>,
}

impl FrameDirectory {
    pub fn new(dir: &Path, fps: u32) -> Self {
        Self {
            dir: dir.to_path_buf(),
            frame_interval: Duration::from_secs(1) / fps.max(1),
            files: Vec::new(),
            position: 0,
            last_frame: None,
        }
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

impl CaptureSource for FrameDirectory {
    fn describe(&self) -> String {
        format!("frame directory {:?}", self.dir)
    }

    fn open(&mut self) -> Result<(), CaptureError> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| CaptureError::Connection(format!("couldn't open {:?}: {}", self.dir, e)))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image_file(path))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(CaptureError::Connection(format!("no frames in {:?}", self.dir)));
        }
        debug!("Opened {} frames from {:?}", files.len(), self.dir);
        self.files = files;
        self.position = 0;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<DynamicImage, CaptureError> {
        let path = self
            .files
            .get(self.position)
            .ok_or(CaptureError::EndOfStream)?
            .clone();
        self.position += 1;
        pace(&mut self.last_frame, self.frame_interval);
        image::open(&path).map_err(|e| CaptureError::Frame(format!("{:?}: {}", path, e)))
    }
}

/// Synthetic scene for demo and testing: a noisy static background with a
/// bright target that wanders through the frame during activity periods.
pub struct SimulatedCamera {
    width: u32,
    height: u32,
    frame_interval: Duration,
    active_period: Duration,
    rng: StdRng,
    noise_std: f64,
    time: f64,
    last_frame: Option<Instant>,
}

impl SimulatedCamera {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            frame_interval: Duration::from_secs(1) / fps.max(1),
            active_period: Duration::from_secs(45),
            rng: StdRng::from_entropy(),
            noise_std: 2.0,
            time: 0.0,
            last_frame: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Render the frame at simulation time `t` seconds
    fn render(&mut self, t: f64) -> GrayImage {
        let (w, h) = (self.width as f64, self.height as f64);
        let period = self.active_period.as_secs_f64();
        let active = (t / period) as u64 % 2 == 1;

        // Lissajous path for the target
        let cx = w * (0.5 + 0.35 * (2.0 * PI * t / 7.0).sin());
        let cy = h * (0.5 + 0.35 * (2.0 * PI * t / 5.0).cos());
        let radius = (w.min(h) * 0.08).max(2.0);

        let mut img = GrayImage::new(self.width, self.height);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let (xf, yf) = (x as f64, y as f64);
            let mut value = 60.0 + 40.0 * yf / h;
            if active && ((xf - cx).powi(2) + (yf - cy).powi(2)).sqrt() < radius {
                value = 230.0;
            }
            let noise: f64 = self.rng.sample(StandardNormal);
            value += self.noise_std * noise;
            *pixel = Luma([value.clamp(0.0, 255.0) as u8]);
        }
        img
    }
}

impl CaptureSource for SimulatedCamera {
    fn describe(&self) -> String {
        format!("simulated camera {}x{}", self.width, self.height)
    }

    fn open(&mut self) -> Result<(), CaptureError> {
        self.last_frame = None;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<DynamicImage, CaptureError> {
        pace(&mut self.last_frame, self.frame_interval);
        self.time += self.frame_interval.as_secs_f64();
        let t = self.time;
        Ok(DynamicImage::ImageLuma8(self.render(t)))
    }
}
