//! Output level tracking
//!
//! Tracks per-channel magnitude and peak over the mixed output. The render
//! path only ever raises levels (attack); the engine's low-priority
//! visualization thread applies decay at ~200 Hz so readings fall smoothly
//! even when the audio callback stalls.

use crate::audio::types::{ChannelLevel, LevelReading, StereoFrame};
use crate::config::AtomicF32;

/// Magnitude decay per visualization tick.
const MAGNITUDE_DECAY: f32 = 0.92;

/// Peak-hold decay per visualization tick.
const PEAK_DECAY: f32 = 0.98;

/// Readings below this floor snap to zero.
const FLOOR: f32 = 1e-5;

pub struct LevelTracker {
    left_magnitude: AtomicF32,
    right_magnitude: AtomicF32,
    left_peak: AtomicF32,
    right_peak: AtomicF32,
}

impl LevelTracker {
    pub fn new() -> Self {
        Self {
            left_magnitude: AtomicF32::new(0.0),
            right_magnitude: AtomicF32::new(0.0),
            left_peak: AtomicF32::new(0.0),
            right_peak: AtomicF32::new(0.0),
        }
    }

    /// Observe one mixed block (audio thread; lock-free).
    pub(crate) fn observe_block(&self, block: &[StereoFrame]) {
        let mut left = 0.0f32;
        let mut right = 0.0f32;
        for frame in block {
            left = left.max(frame.left.abs());
            right = right.max(frame.right.abs());
        }

        if left > self.left_magnitude.load() {
            self.left_magnitude.store(left);
        }
        if right > self.right_magnitude.load() {
            self.right_magnitude.store(right);
        }
        if left > self.left_peak.load() {
            self.left_peak.store(left);
        }
        if right > self.right_peak.load() {
            self.right_peak.store(right);
        }
    }

    /// One decay step (visualization thread).
    pub(crate) fn decay(&self) {
        for (cell, factor) in [
            (&self.left_magnitude, MAGNITUDE_DECAY),
            (&self.right_magnitude, MAGNITUDE_DECAY),
            (&self.left_peak, PEAK_DECAY),
            (&self.right_peak, PEAK_DECAY),
        ] {
            let value = cell.load() * factor;
            cell.store(if value < FLOOR { 0.0 } else { value });
        }
    }

    pub fn reading(&self) -> LevelReading {
        LevelReading {
            left: ChannelLevel {
                magnitude: self.left_magnitude.load(),
                peak: self.left_peak.load(),
            },
            right: ChannelLevel {
                magnitude: self.right_magnitude.load(),
                peak: self.right_peak.load(),
            },
        }
    }
}

impl Default for LevelTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observes_block_peaks() {
        let tracker = LevelTracker::new();
        let block = [
            StereoFrame::new(0.2, -0.7),
            StereoFrame::new(-0.5, 0.1),
        ];
        tracker.observe_block(&block);

        let reading = tracker.reading();
        assert!((reading.left.peak - 0.5).abs() < 1e-6);
        assert!((reading.right.peak - 0.7).abs() < 1e-6);
    }

    #[test]
    fn decays_to_zero() {
        let tracker = LevelTracker::new();
        tracker.observe_block(&[StereoFrame::new(1.0, 1.0)]);

        for _ in 0..2000 {
            tracker.decay();
        }
        let reading = tracker.reading();
        assert_eq!(reading.left.magnitude, 0.0);
        assert_eq!(reading.right.peak, 0.0);
    }
}
