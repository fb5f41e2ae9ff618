//! Two-deck transition state machine
//!
//! Runs on the control thread, driven by position events of the main deck.
//! The machine walks pre-cue -> cue -> transit -> idle across a track's
//! transition anchors: it notifies listeners at the pre-cue point, loads the
//! next track at the cue point, starts the other deck when the transition
//! window opens, and shapes the fade-out (and, for long-leading tracks, the
//! fade-in) until the outgoing deck stops.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::{debug, info};

use crate::config::SettingsHandle;
use crate::events::{DeckIndex, EngineEvent};
use crate::playback::deck::Deck;
use crate::track::TrackQueue;

/// Engine-level transition phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionState {
    /// No transition pending.
    Idle,
    /// Pre-cue notification sent; waiting for the cue point.
    Cueing,
    /// Next track requested; waiting for the transition window.
    Cued,
    /// Crossfade in progress.
    Transit,
}

/// Mutable controller state, guarded by the engine's coarse control lock.
pub(crate) struct ControlState {
    pub transition: TransitionState,
    /// The outgoing deck of the current transition.
    pub transiting: Option<DeckIndex>,
    /// Decks holding a loaded track, head first. The head is the main deck.
    pub deck_queue: VecDeque<DeckIndex>,
    /// True between `play()` and `stop()` / queue exhaustion.
    pub keep_playing: bool,
    /// Pending user-requested forced fades.
    pub force_fade: u32,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            transition: TransitionState::Idle,
            transiting: None,
            deck_queue: VecDeque::new(),
            keep_playing: false,
            force_fade: 0,
        }
    }

    pub fn main_deck(&self) -> Option<DeckIndex> {
        self.deck_queue.front().copied()
    }
}

/// Immutable context handed to the controller handlers.
pub(crate) struct Ctx<'a> {
    pub decks: &'a [Deck; 2],
    pub settings: &'a SettingsHandle,
    pub queue: &'a Mutex<Box<dyn TrackQueue>>,
}

impl<'a> Ctx<'a> {
    fn deck(&self, index: DeckIndex) -> &Deck {
        &self.decks[index.ordinal()]
    }

    fn any_playing(&self) -> bool {
        self.decks.iter().any(|d| d.is_playing())
    }
}

/// Shaped fade-out gain for linear progress in [0, 1].
pub(crate) fn fade_out_gain(progress: f64, factor: f64) -> f32 {
    (1.0 - progress.clamp(0.0, 1.0)).powf(factor) as f32
}

/// Shaped fade-in gain for clamped progress in [0.25, 1].
pub(crate) fn fade_in_gain(progress: f64, factor: f64) -> f32 {
    progress.clamp(0.25, 1.0).powf(factor) as f32
}

/// Pull one track from the queue onto the deck opposite `from` (or onto a
/// free deck when `from` is None). Returns false when the queue is empty.
///
/// A deck stuck loading is force-unloaded first; a load that later fails
/// re-enters the controller through `on_load_failed`.
pub(crate) fn load_next(ctx: &Ctx, from: Option<DeckIndex>, autoplay: bool) -> bool {
    let target = match from {
        Some(index) => ctx.deck(index.other()),
        None => {
            let free = ctx.decks.iter().find(|d| !d.is_loaded() && !d.is_loading());
            match free {
                Some(deck) => deck,
                None => return false,
            }
        }
    };

    if target.is_loading() {
        debug!("{}: force-unloading stale load", target.index());
        target.unload();
    }

    let track = ctx.queue.lock().unwrap().fetch_next();
    match track {
        Some(track) => {
            target.load_internal(track, autoplay);
            true
        }
        None => false,
    }
}

/// Main-deck position event: advance the state machine and drive fades.
pub(crate) fn on_position(
    state: &mut ControlState,
    ctx: &Ctx,
    events: &mut Vec<EngineEvent>,
    sender: DeckIndex,
    position: f64,
) {
    if state.main_deck() != Some(sender) {
        return;
    }

    let sender_deck = ctx.deck(sender);
    let other = ctx.deck(sender.other());
    let Some(anchors) = sender_deck.anchors() else {
        return;
    };
    let leading = other.leading_duration();
    let factor = ctx.settings.fading_factor();

    if state.transition == TransitionState::Idle && position > anchors.pre_cue {
        state.transition = TransitionState::Cueing;
        events.push(EngineEvent::PreCueNext);
        debug!("{sender}: pre-cue at {position:.2}s");
    }

    if matches!(
        state.transition,
        TransitionState::Idle | TransitionState::Cueing
    ) && position > anchors.cue
    {
        if load_next(ctx, Some(sender), false) || state.force_fade > 0 {
            state.transition = TransitionState::Cued;
            state.transiting = Some(sender);
            debug!("{sender}: cued at {position:.2}s");
        }
        // Queue empty and no forced fade: stay put, the track plays out.
    }

    if state.transition == TransitionState::Cued
        && position > anchors.transition_start - leading
        && (other.is_loaded() || (state.force_fade > 0 && !other.is_loading()))
    {
        state.transition = TransitionState::Transit;
        if other.is_loaded() {
            other.set_volume(1.0);
            let max_leading = ctx.settings.max_leading_duration();
            if state.force_fade > 0 && leading >= max_leading {
                // A forced fade should not sit through a long intro: skip
                // ahead so only max_leading of it is heard.
                let skip_to = other
                    .anchors()
                    .map(|a| a.first_audible + leading - max_leading)
                    .unwrap_or(0.0);
                other.set_position_seconds(skip_to);
            }
            other.start();
            info!("transiting to {}", other.index());
        } else {
            info!("{sender}: forced fade with no next track");
        }
    }

    if state.transition == TransitionState::Transit {
        if other.is_loaded() && leading >= ctx.settings.max_leading_duration() {
            let progress_in = (position - (anchors.transition_start - leading)) / leading;
            other.set_volume(fade_in_gain(progress_in, factor));
        }

        if position >= anchors.transition_start {
            let duration = anchors.transition_end - anchors.transition_start;
            if duration > 0.0 {
                let progress = (position - anchors.transition_start) / duration;
                sender_deck.set_volume(fade_out_gain(progress, factor));
            }

            if position > anchors.transition_end {
                debug!("{sender}: transition complete at {position:.2}s");
                sender_deck.stop();
                state.transition = TransitionState::Idle;
                state.transiting = None;
                state.force_fade = state.force_fade.saturating_sub(1);
            }
        }
    }
}

/// Deck finished loading: it joins the deck queue; the head stays main.
pub(crate) fn on_loaded(
    state: &mut ControlState,
    ctx: &Ctx,
    events: &mut Vec<EngineEvent>,
    deck: DeckIndex,
    autoplay: bool,
) {
    if !ctx.deck(deck).is_loaded() {
        // Unloaded again before this event was handled.
        return;
    }

    if !state.deck_queue.contains(&deck) {
        state.deck_queue.push_back(deck);
    }
    refresh_main_flags(state, ctx);
    events.push(EngineEvent::DeckLoaded { deck });

    if autoplay {
        ctx.deck(deck).start();
    }
}

/// A load failed: skip the track and keep the machine coherent.
pub(crate) fn on_load_failed(
    state: &mut ControlState,
    ctx: &Ctx,
    _events: &mut Vec<EngineEvent>,
    deck: DeckIndex,
    autoplay: bool,
) {
    // Mid-transition: the incoming deck failed, try the next queue entry.
    if state.transition == TransitionState::Cued {
        if let Some(sender) = state.transiting {
            if sender.other() == deck {
                if !load_next(ctx, Some(sender), false) && state.force_fade == 0 {
                    state.transition = TransitionState::Cueing;
                    state.transiting = None;
                }
                return;
            }
        }
    }

    // Startup / recovery: nothing is playing, pull the next track.
    if state.keep_playing && !ctx.any_playing() {
        if !load_next(ctx, None, autoplay) {
            state.keep_playing = false;
        }
    }
}

/// Deck unloaded: transition bookkeeping plus the recovery path.
pub(crate) fn on_unloaded(
    state: &mut ControlState,
    ctx: &Ctx,
    events: &mut Vec<EngineEvent>,
    deck: DeckIndex,
) {
    if state.transiting == Some(deck) {
        match state.transition {
            TransitionState::Cued => {
                // Outgoing deck died before the transition window; start
                // the next track right away if it is ready.
                debug!("{deck}: unloaded before transit, starting next deck");
                let next = ctx.deck(deck.other());
                if next.is_loaded() {
                    next.set_volume(1.0);
                    next.start();
                }
            }
            TransitionState::Transit => {
                // The outgoing deck hit its end before the controller saw
                // the completion position; the transit still consumed any
                // pending forced fade.
                state.force_fade = state.force_fade.saturating_sub(1);
            }
            _ => {}
        }
        state.transition = TransitionState::Idle;
        state.transiting = None;
    } else if state.main_deck() == Some(deck) {
        // The main deck played out without ever cueing a successor.
        state.transition = TransitionState::Idle;
    }

    state.deck_queue.retain(|d| *d != deck);
    refresh_main_flags(state, ctx);
    events.push(EngineEvent::DeckUnloaded { deck });

    // Keep the stream going if the caller still wants playback.
    if state.keep_playing && !ctx.any_playing() {
        let more = ctx.queue.lock().unwrap().len() > 0 || ctx.decks.iter().any(|d| d.is_loaded());
        if more {
            // A loaded-but-idle deck resumes; otherwise pull from the queue.
            if let Some(idle) = ctx.decks.iter().find(|d| d.is_loaded() && !d.is_playing()) {
                idle.start();
            } else {
                load_next(ctx, None, true);
            }
        } else {
            state.keep_playing = false;
            info!("queue exhausted, playback ends");
        }
    }
}

/// `play()` semantics: mark the engine live and start a track if silent.
pub(crate) fn on_play(state: &mut ControlState, ctx: &Ctx) {
    state.keep_playing = true;
    if !ctx.any_playing() {
        if let Some(idle) = ctx.decks.iter().find(|d| d.is_loaded() && !d.is_playing()) {
            idle.start();
        } else {
            load_next(ctx, None, true);
        }
    }
}

fn refresh_main_flags(state: &ControlState, ctx: &Ctx) {
    let main = state.main_deck();
    for deck in ctx.decks {
        deck.set_main(Some(deck.index()) == main);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fade_out_is_monotone() {
        let factor = 2.0;
        let mut last = f32::MAX;
        for i in 0..=10 {
            let gain = fade_out_gain(i as f64 / 10.0, factor);
            assert!(gain <= last);
            last = gain;
        }
        assert_eq!(fade_out_gain(0.0, factor), 1.0);
        assert_eq!(fade_out_gain(1.0, factor), 0.0);
    }

    #[test]
    fn fade_in_floor_is_quarter() {
        let factor = 1.0;
        assert_eq!(fade_in_gain(-0.5, factor), 0.25);
        assert_eq!(fade_in_gain(0.0, factor), 0.25);
        assert_eq!(fade_in_gain(1.0, factor), 1.0);
        assert_eq!(fade_in_gain(2.0, factor), 1.0);
    }

    #[test]
    fn linear_factor_keeps_crossfade_sum_bounded() {
        // With factor 1 the fades are linear; their sum stays within [0, 2].
        for i in 0..=20 {
            let t = i as f64 / 20.0;
            let sum = fade_out_gain(t, 1.0) + fade_in_gain(t, 1.0);
            assert!((0.0..=2.0).contains(&sum));
        }
    }
}
