//! Core audio data types

use serde::{Deserialize, Serialize};

/// One stereo frame of 32-bit float audio.
///
/// All internal audio is stereo; mono sources are duplicated to both
/// channels at decode time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StereoFrame {
    pub left: f32,
    pub right: f32,
}

impl StereoFrame {
    /// Silent frame.
    pub const ZERO: StereoFrame = StereoFrame {
        left: 0.0,
        right: 0.0,
    };

    pub fn new(left: f32, right: f32) -> Self {
        Self { left, right }
    }

    /// Duplicate a mono sample onto both channels.
    pub fn from_mono(sample: f32) -> Self {
        Self {
            left: sample,
            right: sample,
        }
    }

    /// Scale both channels.
    pub fn scaled(self, gain: f32) -> Self {
        Self {
            left: self.left * gain,
            right: self.right * gain,
        }
    }

    /// Mix another frame into this one.
    pub fn add(&mut self, other: StereoFrame) {
        self.left += other.left;
        self.right += other.right;
    }

    /// Clamp both channels to [-1, 1] to prevent clipping at the device.
    pub fn clamped(self) -> Self {
        Self {
            left: self.left.clamp(-1.0, 1.0),
            right: self.right.clamp(-1.0, 1.0),
        }
    }

    /// Channel-count-normalized magnitude used by the audibility scanner.
    pub fn magnitude(self) -> f32 {
        (self.left.abs() + self.right.abs()) * 0.5
    }
}

/// Convert decibels to a linear gain factor.
pub fn db_to_gain(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Per-channel level reading (smoothed magnitude plus decaying peak).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChannelLevel {
    pub magnitude: f32,
    pub peak: f32,
}

/// Stereo level reading returned by `Engine::level`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LevelReading {
    pub left: ChannelLevel,
    pub right: ChannelLevel,
}
