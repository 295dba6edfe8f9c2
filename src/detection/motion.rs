// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Per-frame pixel change estimation against a running average frame

use ndarray::{Array2, Zip};

use crate::config::ProcessingConfig;

/// Grayscale frame as floating point intensities (rows x columns)
pub type Frame = Array2<f32>;

/// Counts changed pixels between each frame and an exponentially weighted
/// running average of the frames before it.
#[derive(Debug, Clone)]
pub struct AverageMotionProcessor {
    average: Option<Frame>,
    weight: f32,
    threshold: f32,
    dilation_iterations: u32,
}

impl AverageMotionProcessor {
    pub fn new(options: &ProcessingConfig) -> Self {
        Self {
            average: None,
            weight: options.avg_weighting,
            threshold: f32::from(options.fixed_lvl_threshold),
            dilation_iterations: options.dilation_iterations,
        }
    }

    /// Blend `frame` into the average and return the changed pixel count
    pub fn detect_motion(&mut self, frame: &Frame) -> i64 {
        // First frame, or the source changed resolution
        if self.average.as_ref().map_or(true, |avg| avg.dim() != frame.dim()) {
            self.average = Some(frame.clone());
        }
        let average = self.average.get_or_insert_with(|| frame.clone());

        let alpha = self.weight;
        Zip::from(&mut *average)
            .and(frame)
            .for_each(|avg, &px| *avg = (1.0 - alpha) * *avg + alpha * px);

        let threshold = self.threshold;
        let mut mask: Array2<bool> = Zip::from(&*average)
            .and(frame)
            .map_collect(|&avg, &px| (px - avg).abs() > threshold);

        for _ in 0..self.dilation_iterations {
            mask = dilate(&mask);
        }

        mask.iter().filter(|&&changed| changed).count() as i64
    }

    pub fn reset(&mut self) {
        self.average = None;
    }
}

/// One pass of binary dilation with a 3x3 structuring element
pub fn dilate(mask: &Array2<bool>) -> Array2<bool> {
    let (rows, cols) = mask.dim();
    let mut out = Array2::from_elem((rows, cols), false);
    for ((r, c), &set) in mask.indexed_iter() {
        if !set {
            continue;
        }
        for nr in r.saturating_sub(1)..=(r + 1).min(rows - 1) {
            for nc in c.saturating_sub(1)..=(c + 1).min(cols - 1) {
                out[[nr, nc]] = true;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(weight: f32, dilation: u32) -> ProcessingConfig {
        ProcessingConfig {
            avg_weighting: weight,
            dilation_iterations: dilation,
            fixed_lvl_threshold: 20,
            ..ProcessingConfig::default()
        }
    }

    fn frame_with_square(value: f32, top: usize, left: usize, size: usize) -> Frame {
        let mut frame = Array2::from_elem((40, 40), 10.0);
        for r in top..top + size {
            for c in left..left + size {
                frame[[r, c]] = value;
            }
        }
        frame
    }

    #[test]
    fn test_static_scene_has_no_change() {
        let mut processor = AverageMotionProcessor::new(&options(0.5, 0));
        let frame = Array2::from_elem((40, 40), 100.0);
        assert_eq!(processor.detect_motion(&frame), 0);
        assert_eq!(processor.detect_motion(&frame), 0);
    }

    #[test]
    fn test_new_object_is_counted() {
        let mut processor = AverageMotionProcessor::new(&options(0.5, 0));
        processor.detect_motion(&Array2::from_elem((40, 40), 10.0));

        // avg becomes 10 + 0.5 * 190 = 105, delta 95 > 20 inside the square
        let count = processor.detect_motion(&frame_with_square(200.0, 5, 5, 4));
        assert_eq!(count, 16);
    }

    #[test]
    fn test_dilation_grows_mask() {
        let mut plain = AverageMotionProcessor::new(&options(0.5, 0));
        let mut dilated = AverageMotionProcessor::new(&options(0.5, 1));
        let base = Array2::from_elem((40, 40), 10.0);
        let moved = frame_with_square(200.0, 10, 10, 2);

        plain.detect_motion(&base);
        dilated.detect_motion(&base);
        assert_eq!(plain.detect_motion(&moved), 4);
        assert_eq!(dilated.detect_motion(&moved), 16);
    }

    #[test]
    fn test_dilate_clamps_at_edges() {
        let mut mask = Array2::from_elem((3, 3), false);
        mask[[0, 0]] = true;
        let out = dilate(&mask);
        assert_eq!(out.iter().filter(|&&v| v).count(), 4);
    }

    #[test]
    fn test_resolution_change_resets_average() {
        let mut processor = AverageMotionProcessor::new(&options(0.5, 0));
        processor.detect_motion(&Array2::from_elem((40, 40), 10.0));
        let other = Array2::from_elem((20, 30), 250.0);
        assert_eq!(processor.detect_motion(&other), 0);
    }
}
