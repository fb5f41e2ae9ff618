//! Single-deck playback integration tests
//!
//! Drives the engine core by hand: load ordering, position events, natural
//! end of content, seek round-trips, and unload idempotence.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::*;
use segue::{DeckIndex, EngineCore, EngineEvent, MemoryQueue, SettingsSnapshot, TrackQueue};

fn settings() -> SettingsSnapshot {
    SettingsSnapshot {
        max_transition_time: 2.0,
        fading_curve: 50.0,
        ..SettingsSnapshot::default()
    }
}

fn core_with_tracks(tracks: &[&std::path::PathBuf]) -> Arc<EngineCore> {
    let mut queue = MemoryQueue::new();
    for path in tracks {
        queue.push_file(*path);
    }
    EngineCore::with_settings(Box::new(queue), settings(), FIXTURE_RATE)
}

#[test]
fn loaded_precedes_position_and_finished_precedes_unloaded() {
    let fx = FixtureDir::new();
    let track = fx.path("track.wav");
    // 0.5s lead, 3s tone, 1s quiet tail, 1s silence: content ends at 4.5s.
    write_track(&track, FIXTURE_RATE, 0.5, 3.0, 1.0, 1.0);

    let core = core_with_tracks(&[&track]);
    let log = EventLog::new();
    log.install(&core);
    let mut driver = Driver::new(Arc::clone(&core));

    core.play();
    assert!(driver.wait_until(Duration::from_secs(5), || {
        core.deck(DeckIndex::A).is_loaded()
    }));

    // Play the track to its natural end.
    assert!(driver.run_until(4000, || !core.is_playing()));

    let loaded = log.position_of(is_loaded(DeckIndex::A)).unwrap();
    let first_pos = log.position_of(is_position(DeckIndex::A)).unwrap();
    let started = log.position_of(is_started(DeckIndex::A)).unwrap();
    let finished = log.position_of(is_finished(DeckIndex::A)).unwrap();
    let unloaded = log.position_of(is_unloaded(DeckIndex::A)).unwrap();

    assert!(loaded < first_pos, "loaded must precede position events");
    assert!(loaded < started);
    assert!(finished < unloaded, "finished must precede unloaded");

    assert_eq!(log.count(is_finished(DeckIndex::A)), 1);
    assert_eq!(log.count(is_unloaded(DeckIndex::A)), 1);

    // Both decks released, machine idle.
    assert!(!core.deck(DeckIndex::A).is_loaded());
    assert!(!core.deck(DeckIndex::B).is_loaded());
    assert_eq!(core.transition_state(), segue::TransitionState::Idle);
}

#[test]
fn playback_starts_at_first_audible_frame() {
    let fx = FixtureDir::new();
    let track = fx.path("track.wav");
    write_track(&track, FIXTURE_RATE, 1.0, 3.0, 0.0, 1.0);

    let core = core_with_tracks(&[&track]);
    let mut driver = Driver::new(Arc::clone(&core));

    core.play();
    assert!(driver.wait_until(Duration::from_secs(5), || {
        core.deck(DeckIndex::A).is_playing()
    }));

    // The read head skips the leading second of silence.
    let position = core.deck(DeckIndex::A).position_seconds();
    assert!(
        (0.9..1.6).contains(&position),
        "expected start near 1.0s, got {position}"
    );
}

#[test]
fn seek_round_trip_and_clamping() {
    let fx = FixtureDir::new();
    let track = fx.path("track.wav");
    write_track(&track, FIXTURE_RATE, 0.0, 5.0, 0.0, 1.0);

    let core = core_with_tracks(&[&track]);
    let mut driver = Driver::new(Arc::clone(&core));

    core.play();
    assert!(driver.wait_until(Duration::from_secs(5), || {
        core.deck(DeckIndex::A).is_playing()
    }));

    core.seek(2.0);
    let position = core.position();
    let block_secs = BLOCK_FRAMES as f64 / FIXTURE_RATE as f64;
    assert!(
        (position - 2.0).abs() <= block_secs,
        "seek(2.0) landed at {position}"
    );

    // Past-end seeks clamp.
    core.seek(100.0);
    assert!(core.position() <= core.duration() + block_secs);

    // Fractional seek.
    core.seek_fraction(0.5);
    let duration = core.duration();
    assert!((core.position() - duration * 0.5).abs() <= block_secs + 0.01);
}

#[test]
fn unload_is_idempotent() {
    let fx = FixtureDir::new();
    let track = fx.path("track.wav");
    write_track(&track, FIXTURE_RATE, 0.0, 2.0, 0.0, 0.5);

    let core = core_with_tracks(&[&track]);
    let log = EventLog::new();
    log.install(&core);
    let mut driver = Driver::new(Arc::clone(&core));

    core.play();
    assert!(driver.wait_until(Duration::from_secs(5), || {
        core.deck(DeckIndex::A).is_loaded()
    }));

    let deck = core.deck(DeckIndex::A).clone();
    deck.unload();
    deck.unload();
    deck.unload();

    // Give the control thread time to drain.
    driver.wait_until(Duration::from_millis(300), || {
        log.count(is_unloaded(DeckIndex::A)) >= 1
    });

    assert_eq!(log.count(is_unloaded(DeckIndex::A)), 1);
    assert!(!deck.is_loaded());
}

#[test]
fn fading_curve_read_back_is_clamped() {
    let queue = MemoryQueue::new();
    assert!(queue.is_empty());
    let core = EngineCore::with_settings(Box::new(queue), settings(), FIXTURE_RATE);

    core.settings().set_fading_curve(250.0);
    assert_eq!(core.settings().fading_curve(), 100.0);
    core.settings().set_fading_curve(-3.0);
    assert_eq!(core.settings().fading_curve(), 0.0);
    core.settings().set_fading_curve(42.0);
    assert_eq!(core.settings().fading_curve(), 42.0);
}

#[test]
fn level_reading_follows_output() {
    let fx = FixtureDir::new();
    let track = fx.path("track.wav");
    write_track(&track, FIXTURE_RATE, 0.0, 5.0, 0.0, 0.0);

    let core = core_with_tracks(&[&track]);
    let mut driver = Driver::new(Arc::clone(&core));

    core.play();
    assert!(driver.wait_until(Duration::from_secs(5), || {
        core.deck(DeckIndex::A).is_playing()
    }));

    driver.run_until(40, || false);
    let reading = core.level();
    assert!(reading.left.peak > 0.1, "tone should register on the meter");
    assert!(reading.right.peak > 0.1);

    // Silence decays the meter to zero.
    core.stop();
    let mut driver2 = Driver::new(Arc::clone(&core));
    assert!(driver2.wait_until(Duration::from_secs(3), || {
        core.level().left.peak < 0.01
    }));
}

#[test]
fn deck_events_match_deck_queue_invariant() {
    let fx = FixtureDir::new();
    let track = fx.path("track.wav");
    write_track(&track, FIXTURE_RATE, 0.0, 4.0, 0.0, 1.0);

    let core = core_with_tracks(&[&track]);
    let mut driver = Driver::new(Arc::clone(&core));

    // Before play: no main deck.
    assert!(core.main_deck().is_none());

    core.play();
    assert!(driver.wait_until(Duration::from_secs(5), || {
        core.deck(DeckIndex::A).is_loaded()
    }));
    driver.wait_until(Duration::from_millis(300), || core.main_deck().is_some());

    // Exactly one deck is main while a track is loaded.
    assert_eq!(core.main_deck(), Some(DeckIndex::A));
    assert!(core.deck(DeckIndex::A).is_main());
    assert!(!core.deck(DeckIndex::B).is_main());
}

#[test]
fn events_are_cloneable_and_debuggable() {
    let event = EngineEvent::DeckPosition {
        deck: DeckIndex::A,
        position: 3.25,
    };
    let copy = event.clone();
    assert!(format!("{copy:?}").contains("3.25"));
}
