// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Temporal aggregation of pixel change samples into a debounced alarm signal

use std::collections::VecDeque;

use tracing::trace;

/// Value written over samples rejected by [`bandpass_filter`]
pub const REJECTED: i64 = -1;

/// Keep values inside `[low, high]`, replace everything else with [`REJECTED`]
pub fn bandpass_filter(data: &[i64], low: i64, high: i64) -> Vec<i64> {
    data.iter()
        .map(|&v| if v < low || v > high { REJECTED } else { v })
        .collect()
}

/// True when at least `min_frames` samples survive the band-pass with a
/// non-zero pixel count
pub fn is_motion(data: &[i64], low: i64, high: i64, min_frames: usize) -> bool {
    bandpass_filter(data, low, high)
        .into_iter()
        .filter(|&v| v > 0)
        .count()
        >= min_frames
}

/// Slide a `window` over `history` (newest first) and require a `1` in every
/// window position.
///
/// ```text
/// newest [t0, t1, |t2, t3, t4, t5|, t6, t7] oldest
///                  └── window ──┘ -->
/// ```
pub fn is_in_alarm(history: &VecDeque<u8>, window: usize) -> bool {
    if window == 0 || history.len() < window {
        return false;
    }
    let samples: Vec<u8> = history.iter().copied().collect();
    samples.windows(window).all(|w| w.contains(&1))
}

/// One-second aggregation and the rolling motion history
#[derive(Debug, Clone)]
pub struct Debouncer {
    samples_per_second: usize,
    pixel_lo: i64,
    pixel_hi: i64,
    min_movement_s: usize,
    second: Vec<i64>,
    history: VecDeque<u8>,
    capacity: usize,
    alarm: bool,
}

impl Debouncer {
    pub fn new(
        samples_per_second: usize,
        pixel_lo: i64,
        pixel_hi: i64,
        alert_time_s: usize,
        min_movement_s: usize,
    ) -> Self {
        Self {
            samples_per_second: samples_per_second.max(1),
            pixel_lo,
            pixel_hi,
            min_movement_s,
            second: Vec::with_capacity(samples_per_second),
            // Pre-filled so a fresh detector needs a full history of motion
            history: std::iter::repeat(0).take(alert_time_s).collect(),
            capacity: alert_time_s,
            alarm: false,
        }
    }

    /// Add one frame's pixel change count. Returns the current decision,
    /// which only changes when a second's worth of samples has been seen.
    pub fn push_sample(&mut self, pixel_change: i64) -> bool {
        self.second.push(pixel_change);
        if self.second.len() >= self.samples_per_second {
            let moved = is_motion(&self.second, self.pixel_lo, self.pixel_hi, 1);
            trace!("Second window {:?} -> motion {}", self.second, moved);
            self.record_second(moved);
            self.second.clear();
        }
        self.alarm
    }

    fn record_second(&mut self, moved: bool) {
        self.history.push_front(u8::from(moved));
        self.history.truncate(self.capacity);
        self.alarm = is_in_alarm(&self.history, self.min_movement_s);
    }

    pub fn alarm(&self) -> bool {
        self.alarm
    }

    pub fn history(&self) -> &VecDeque<u8> {
        &self.history
    }
}
