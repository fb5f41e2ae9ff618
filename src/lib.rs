//! # segue
//!
//! A two-deck continuous playback engine: a queue of tracks is rendered as
//! one uninterrupted stream by alternating between two decks, with
//! crossfades computed from per-track audibility analysis (leading silence,
//! trailing silence, transition cue points).
//!
//! **Architecture:** symphonia decode -> read-ahead ring -> rubato resample
//! -> gain-ramped deck output -> mixer -> cpal device callback, with a
//! control thread running the transition state machine off deck position
//! events.
//!
//! The typical entry point is [`Engine`], which binds the engine core to an
//! output device. Embedders that drive rendering themselves (or tests) use
//! [`EngineCore::render`] directly.

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod playback;
pub mod track;

pub use audio::output::{DeviceSelector, DeviceTypeInfo};
pub use audio::types::{ChannelLevel, LevelReading, StereoFrame};
pub use config::SettingsSnapshot;
pub use engine::{Engine, EngineCore};
pub use error::{Error, Result};
pub use events::{DeckIndex, EngineEvent, EngineListener};
pub use playback::{Deck, DeckAnchors, DeckState, TransitionState};
pub use track::{FileTrack, MemoryQueue, Track, TrackQueue};
