//! Engine control-surface integration tests
//!
//! Pause/resume ramps, stop during a transition, output format changes, and
//! the long-leading fade-in path.

mod helpers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use helpers::*;
use segue::{DeckIndex, EngineCore, MemoryQueue, SettingsSnapshot, StereoFrame, TransitionState};

fn settings() -> SettingsSnapshot {
    SettingsSnapshot {
        max_transition_time: 2.0,
        fading_curve: 50.0,
        ..SettingsSnapshot::default()
    }
}

fn peak(block: &[StereoFrame]) -> f32 {
    block.iter().map(|f| f.left.abs()).fold(0.0, f32::max)
}

#[test]
fn pause_and_resume_ramp_without_position_jump() {
    let fx = FixtureDir::new();
    let track = fx.path("tone.wav");
    write_track(&track, FIXTURE_RATE, 0.0, 10.0, 0.0, 0.0);

    let mut queue = MemoryQueue::new();
    queue.push_file(&track);
    let core = EngineCore::with_settings(Box::new(queue), settings(), FIXTURE_RATE);
    let mut driver = Driver::new(Arc::clone(&core));

    core.play();
    assert!(driver.wait_until(Duration::from_secs(5), || {
        core.deck(DeckIndex::A).is_playing()
    }));
    let mut audible = false;
    for _ in 0..50 {
        if peak(driver.step()) > 0.1 {
            audible = true;
            break;
        }
    }
    assert!(audible, "playback never became audible");

    // Pause: the next block ramps down, later blocks are silent.
    assert!(core.toggle_pause());
    let ramp_block = driver.step().to_vec();
    assert!(peak(&ramp_block[..32]) > 0.0, "ramp block starts audible");
    let tail = &ramp_block[ramp_block.len() - 16..];
    assert!(peak(tail) < 0.05, "ramp block ends near silence");

    let silent = driver.step().to_vec();
    assert!(peak(&silent) == 0.0, "paused blocks are silent");

    // Position freezes while paused.
    let paused_at = core.position();
    for _ in 0..10 {
        driver.step();
    }
    assert_eq!(core.position(), paused_at);

    // Resume: the next block ramps back up; no position jump.
    assert!(!core.toggle_pause());
    let resume_block = driver.step().to_vec();
    let head = peak(&resume_block[..32]);
    let tail = peak(&resume_block[resume_block.len() - 32..]);
    assert!(tail > head, "resume ramp grows over the block");

    let block_secs = BLOCK_FRAMES as f64 / FIXTURE_RATE as f64;
    let resumed_at = core.position();
    assert!(
        (resumed_at - paused_at).abs() <= 2.0 * block_secs + 0.13,
        "position jumped across pause: {paused_at} -> {resumed_at}"
    );
}

#[test]
fn stop_during_transit_unloads_both_decks() {
    let fx = FixtureDir::new();
    let a = fx.path("a.wav");
    let b = fx.path("b.wav");
    write_track(&a, FIXTURE_RATE, 0.5, 6.5, 1.0, 2.0);
    write_track(&b, FIXTURE_RATE, 0.5, 6.5, 1.0, 2.0);

    let mut queue = MemoryQueue::new();
    queue.push_file(&a);
    queue.push_file(&b);
    let core = EngineCore::with_settings(Box::new(queue), settings(), FIXTURE_RATE);
    let mut driver = Driver::new(Arc::clone(&core));

    core.play();
    assert!(driver.run_until(4000, || {
        core.transition_state() == TransitionState::Transit
    }));

    // Stop from another thread while this one keeps the "audio device"
    // running, as a real caller would.
    let stopper = {
        let core = Arc::clone(&core);
        std::thread::spawn(move || {
            let started = Instant::now();
            core.stop();
            started.elapsed()
        })
    };

    while !stopper.is_finished() {
        driver.step();
    }
    let elapsed = stopper.join().unwrap();

    assert!(elapsed < Duration::from_secs(2), "stop took {elapsed:?}");
    assert!(!core.deck(DeckIndex::A).is_loaded());
    assert!(!core.deck(DeckIndex::B).is_loaded());
    assert!(!core.is_playing());

    driver.wait_until(Duration::from_millis(300), || {
        core.transition_state() == TransitionState::Idle
    });
    assert_eq!(core.transition_state(), TransitionState::Idle);
}

#[test]
fn output_rate_change_keeps_position_continuity() {
    const RATE: u32 = 44_100;

    let fx = FixtureDir::new();
    let track = fx.path("tone.wav");
    write_track(&track, RATE, 0.0, 4.0, 0.0, 0.0);

    let mut queue = MemoryQueue::new();
    queue.push_file(&track);
    let core = EngineCore::with_settings(Box::new(queue), settings(), RATE);
    let log = EventLog::new();
    log.install(&core);
    let mut driver = Driver::new(Arc::clone(&core));

    core.play();
    assert!(driver.wait_until(Duration::from_secs(5), || {
        core.deck(DeckIndex::A).is_playing()
    }));
    assert!(driver.run_until(200, || core.position() > 0.3));

    let before = core.position();
    core.set_output_rate(48_000);
    driver.step();
    let after = core.position();

    // Position stays continuous (allowing block and resampler chunk slack).
    assert!(
        (after - before).abs() < 0.05,
        "position drifted across format change: {before} -> {after}"
    );

    // Playback continues and advances at the new rate.
    assert!(driver.run_until(100, || core.position() > after + 0.2));

    driver.wait_until(Duration::from_millis(300), || log.any(is_device_changed));
    assert_eq!(log.count(is_device_changed), 1);

    // Setting the same rate again does not re-announce.
    core.set_output_rate(48_000);
    driver.wait_until(Duration::from_millis(200), || false);
    assert_eq!(log.count(is_device_changed), 1);
}

#[test]
fn long_leading_incoming_deck_fades_in() {
    let fx = FixtureDir::new();
    let a = fx.path("a.wav");
    let b = fx.path("b.wav");
    write_track(&a, FIXTURE_RATE, 0.5, 6.5, 1.0, 2.0);
    // B's audible content starts at 3.0 s: longer than max_leading (2.5 s).
    write_track(&b, FIXTURE_RATE, 3.0, 5.0, 0.0, 1.0);

    let mut queue = MemoryQueue::new();
    queue.push_file(&a);
    queue.push_file(&b);
    let core = EngineCore::with_settings(Box::new(queue), settings(), FIXTURE_RATE);
    let log = EventLog::new();
    log.install(&core);
    let mut driver = Driver::new(Arc::clone(&core));

    core.play();
    assert!(driver.wait_until(Duration::from_secs(5), || {
        core.deck(DeckIndex::A).is_playing()
    }));

    // Observe B's volume while both decks are live.
    let deck_b = core.deck(DeckIndex::B).clone();
    let mut saw_partial_volume = false;
    let mut blocks = 0;
    while !log.any(is_finished(DeckIndex::A)) && blocks < 6000 {
        driver.step();
        blocks += 1;
        if deck_b.is_playing() && deck_b.volume() < 0.99 {
            saw_partial_volume = true;
        }
    }

    assert!(log.any(is_started(DeckIndex::B)));
    assert!(
        saw_partial_volume,
        "a long-leading track must fade in rather than cut in"
    );

    // By the end of the transition the incoming deck reaches unity.
    assert!(driver.run_until(500, || deck_b.volume() > 0.95));
}
