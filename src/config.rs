//! Engine settings
//!
//! Runtime-tunable parameters shared between the control surface, the
//! transition controller, and the decks. All fields are lock-free so the
//! audio thread can read them mid-block.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Seconds between the cue point and the transition start.
///
/// The cue must fire early enough for the loading worker to open, probe, and
/// pre-buffer the next track.
pub const CUE_EPSILON_SECS: f64 = 12.0;

/// Seconds between the pre-cue notification and the cue point.
pub const PRE_CUE_EPSILON_SECS: f64 = 4.0;

/// Frames over which stop and pause ramps run to avoid clicks.
pub const RAMP_FRAMES: usize = 256;

/// Lock-free f32 cell (bit-cast through AtomicU32).
pub(crate) struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// Plain-data snapshot of the engine settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    /// Master gain, linear, [0, 1].
    pub gain: f32,
    /// Fade curve shape, [0, 100]. Higher values bend the fade harder.
    pub fading_curve: f64,
    /// Upper bound on the crossfade window, seconds.
    pub max_transition_time: f64,
    /// Leading silence above this duration is faded in instead of cut in.
    pub max_leading_duration: f64,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            gain: 1.0,
            fading_curve: 60.0,
            max_transition_time: 12.0,
            max_leading_duration: 2.5,
        }
    }
}

/// Shared settings handle.
pub struct Settings {
    gain: AtomicF32,
    fading_curve: AtomicF32,
    fading_factor: AtomicF32,
    max_transition_time: AtomicF32,
    max_leading_duration: AtomicF32,
}

/// Cheaply clonable handle to the engine settings.
pub type SettingsHandle = Arc<Settings>;

impl Settings {
    pub fn new(snapshot: SettingsSnapshot) -> SettingsHandle {
        let settings = Self {
            gain: AtomicF32::new(snapshot.gain.clamp(0.0, 1.0)),
            fading_curve: AtomicF32::new(0.0),
            fading_factor: AtomicF32::new(1.0),
            max_transition_time: AtomicF32::new(snapshot.max_transition_time.max(0.0) as f32),
            max_leading_duration: AtomicF32::new(snapshot.max_leading_duration.max(0.0) as f32),
        };
        settings.set_fading_curve(snapshot.fading_curve);
        Arc::new(settings)
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            gain: self.gain(),
            fading_curve: self.fading_curve(),
            max_transition_time: self.max_transition_time(),
            max_leading_duration: self.max_leading_duration(),
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain.load()
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.store(gain.clamp(0.0, 1.0));
    }

    pub fn fading_curve(&self) -> f64 {
        self.fading_curve.load() as f64
    }

    /// Set the fade curve shape and derive the fade exponent from it.
    ///
    /// The exponent maps curve 0 to 1.0 (linear fades) and curve 100 to
    /// 1000.0 (very steep fades).
    pub fn set_fading_curve(&self, curve: f64) {
        let curve = curve.clamp(0.0, 100.0);
        let out_range = 1000.0 - 1.0;
        let factor = 1000.0 / (((100.0 - curve) / 100.0 * out_range) + 1.0);
        self.fading_curve.store(curve as f32);
        self.fading_factor.store(factor as f32);
    }

    /// Exponent applied to linear fade progress.
    pub fn fading_factor(&self) -> f64 {
        self.fading_factor.load() as f64
    }

    pub fn max_transition_time(&self) -> f64 {
        self.max_transition_time.load() as f64
    }

    pub fn set_max_transition_time(&self, seconds: f64) {
        self.max_transition_time.store(seconds.max(0.0) as f32);
    }

    pub fn max_leading_duration(&self) -> f64 {
        self.max_leading_duration.load() as f64
    }

    pub fn set_max_leading_duration(&self, seconds: f64) {
        self.max_leading_duration.store(seconds.max(0.0) as f32);
    }
}
