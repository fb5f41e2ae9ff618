//! Engine and deck events
//!
//! Two layers of events exist:
//!
//! - `ControlMsg`: internal messages flowing from the audio callback, the
//!   loading worker, and the control surface into the engine's control
//!   thread. The audio thread only ever performs a non-blocking send.
//! - `EngineEvent`: the externally visible events dispatched to the single
//!   registered listener, in FIFO order, on the control thread (never on the
//!   audio thread).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one of the two decks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeckIndex {
    A,
    B,
}

impl DeckIndex {
    /// The other deck.
    pub fn other(self) -> DeckIndex {
        match self {
            DeckIndex::A => DeckIndex::B,
            DeckIndex::B => DeckIndex::A,
        }
    }

    /// Stable name used in log lines.
    pub fn name(self) -> &'static str {
        match self {
            DeckIndex::A => "deck A",
            DeckIndex::B => "deck B",
        }
    }

    /// Array index (0 or 1).
    pub fn ordinal(self) -> usize {
        match self {
            DeckIndex::A => 0,
            DeckIndex::B => 1,
        }
    }
}

impl fmt::Display for DeckIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Externally visible engine events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A deck finished loading a track.
    DeckLoaded { deck: DeckIndex },

    /// A deck released its track and buffers.
    DeckUnloaded { deck: DeckIndex },

    /// A deck began producing audio.
    DeckStarted { deck: DeckIndex },

    /// A deck reached the end of its audible content or was stopped.
    DeckFinished { deck: DeckIndex },

    /// Playback position of a deck, seconds from file start.
    DeckPosition { deck: DeckIndex, position: f64 },

    /// The next-track selection window opened; callers that fill the queue
    /// lazily should enqueue now.
    PreCueNext,

    /// The output device or its format changed.
    AudioDeviceChanged,
}

/// Single listener receiving engine events on the control thread.
///
/// Callbacks must not block: the control thread also drives the transition
/// state machine.
pub trait EngineListener: Send {
    fn on_event(&mut self, event: EngineEvent);
}

impl<F: FnMut(EngineEvent) + Send> EngineListener for F {
    fn on_event(&mut self, event: EngineEvent) {
        self(event)
    }
}

/// Internal control messages.
///
/// Everything that has to leave the audio thread or the loading worker goes
/// through this channel and is handled serially by the control thread.
pub(crate) enum ControlMsg {
    /// A deck's read head advanced; seconds from file start.
    Position { deck: DeckIndex, position: f64 },

    /// A deck finished loading; `track_id` correlates log lines.
    Loaded {
        deck: DeckIndex,
        track_id: Uuid,
        autoplay: bool,
    },

    /// A load failed; the track was skipped.
    LoadFailed { deck: DeckIndex, autoplay: bool },

    /// A deck stopped producing audio (natural end or stop request).
    Finished { deck: DeckIndex },

    /// A deck released its track.
    Unloaded { deck: DeckIndex },

    /// A deck started producing audio.
    Started { deck: DeckIndex },

    /// Forward a bare event to the listener without controller bookkeeping.
    Notify(EngineEvent),

    /// Ask the control thread to run `play` semantics (load and start when
    /// nothing is playing).
    Play,

    /// Control thread shutdown sentinel.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deck_index_other() {
        assert_eq!(DeckIndex::A.other(), DeckIndex::B);
        assert_eq!(DeckIndex::B.other(), DeckIndex::A);
        assert_eq!(DeckIndex::A.ordinal(), 0);
        assert_eq!(DeckIndex::B.ordinal(), 1);
    }

    #[test]
    fn events_serialize() {
        let event = EngineEvent::DeckPosition {
            deck: DeckIndex::B,
            position: 1.5,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("DeckPosition"));
        assert!(json.contains("1.5"));
    }
}
