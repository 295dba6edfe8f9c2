//! Detection module - motion decision engine
//!
//! Stage A turns each frame into a changed-pixel count
//! ([`AverageMotionProcessor`]); stage B aggregates the counts per second and
//! debounces them into an alarm-worthy signal ([`Debouncer`]).

mod debounce;
mod motion;

pub use debounce::*;
pub use motion::*;

use tracing::debug;

use crate::config::Config;

/// Motion decision engine. Lives inside the detection worker only.
pub struct MotionDetector {
    processor: AverageMotionProcessor,
    debouncer: Debouncer,
    last_decision: bool,
}

impl MotionDetector {
    pub fn new(config: &Config) -> Self {
        let processing = &config.processing;
        let alerting = &config.alerting;
        Self {
            processor: AverageMotionProcessor::new(processing),
            debouncer: Debouncer::new(
                processing.fps as usize,
                processing.pixel_threshold_lo,
                processing.pixel_threshold_hi,
                alerting.alert_time_s as usize,
                alerting.min_movement_s as usize,
            ),
            last_decision: false,
        }
    }

    /// Feed the next (already blurred, grayscale) frame.
    /// Returns whether the scene is currently alarm-worthy.
    pub fn update(&mut self, frame: &Frame) -> bool {
        let pixel_change = self.processor.detect_motion(frame);
        let decision = self.debouncer.push_sample(pixel_change);
        if decision != self.last_decision {
            debug!("Alarm threshold reached changed to {}", decision);
            self.last_decision = decision;
        }
        decision
    }

    pub fn decision(&self) -> bool {
        self.last_decision
    }
}
