//! Mixer: sums the two decks into the device callback buffer
//!
//! Runs entirely on the audio thread. Pause is a mixer concern: the first
//! paused block ramps to zero and stalls the decks (their positions freeze),
//! the first resumed block ramps back to unity. After summation an optional
//! post-processor chain runs, then the level tracker observes the block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::audio::types::StereoFrame;
use crate::config::{SettingsHandle, RAMP_FRAMES};
use crate::playback::deck::Deck;
use crate::playback::level::LevelTracker;

/// Post-summation hook (external gain/limiter DSP).
pub type PostProcessor = Box<dyn FnMut(&mut [StereoFrame]) + Send>;

struct MixState {
    /// True once a pause ramp completed; decks are no longer pulled.
    stalled: bool,
    scratch_a: Vec<StereoFrame>,
    scratch_b: Vec<StereoFrame>,
    post: Option<PostProcessor>,
}

pub struct Mixer {
    paused: AtomicBool,
    settings: SettingsHandle,
    state: Mutex<MixState>,
}

impl Mixer {
    pub(crate) fn new(settings: SettingsHandle) -> Self {
        Self {
            paused: AtomicBool::new(false),
            settings,
            state: Mutex::new(MixState {
                stalled: false,
                scratch_a: Vec::new(),
                scratch_b: Vec::new(),
                post: None,
            }),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Flip the pause state; returns the new state.
    pub fn toggle_paused(&self) -> bool {
        !self.paused.fetch_xor(true, Ordering::AcqRel)
    }

    /// Install the post-summation processor chain.
    pub fn set_post_processor(&self, post: Option<PostProcessor>) {
        self.state.lock().unwrap().post = post;
    }

    /// Mix one block. Returns, per deck, whether it rendered content (used
    /// by the engine to emit position events).
    pub(crate) fn render(
        &self,
        decks: &[Deck; 2],
        levels: &LevelTracker,
        out: &mut [StereoFrame],
    ) -> [bool; 2] {
        let paused = self.paused.load(Ordering::Acquire);
        let mut state = self.state.lock().unwrap();
        let MixState {
            stalled,
            scratch_a,
            scratch_b,
            post,
        } = &mut *state;

        if paused && *stalled {
            out.fill(StereoFrame::ZERO);
            return [false, false];
        }

        let n = out.len();
        if scratch_a.len() < n {
            scratch_a.resize(n, StereoFrame::ZERO);
            scratch_b.resize(n, StereoFrame::ZERO);
        }

        let rendered_a = decks[0].render_block(&mut scratch_a[..n]);
        let rendered_b = decks[1].render_block(&mut scratch_b[..n]);

        let master = self.settings.gain();
        for i in 0..n {
            let mut frame = scratch_a[i];
            frame.add(scratch_b[i]);
            out[i] = frame.scaled(master).clamped();
        }

        if paused {
            // First paused block: ramp to silence, then stall.
            let ramp = RAMP_FRAMES.min(n);
            for (i, frame) in out[..ramp].iter_mut().enumerate() {
                *frame = frame.scaled(1.0 - (i as f32 + 1.0) / ramp as f32);
            }
            out[ramp..].fill(StereoFrame::ZERO);
            *stalled = true;
        } else if *stalled {
            // First resumed block: ramp back up from silence.
            let ramp = RAMP_FRAMES.min(n);
            for (i, frame) in out[..ramp].iter_mut().enumerate() {
                *frame = frame.scaled((i as f32 + 1.0) / ramp as f32);
            }
            *stalled = false;
        }

        if let Some(post) = post.as_mut() {
            post(out);
        }

        levels.observe_block(out);

        [rendered_a, rendered_b]
    }
}
