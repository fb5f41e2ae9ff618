//! Shared fixtures for the integration tests
//!
//! Generates deterministic WAV files with known audibility layouts and
//! drives `EngineCore::render` by hand, so every scenario runs without
//! audio hardware.

#![allow(dead_code)]

use std::f32::consts::PI;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use hound::{SampleFormat, WavSpec, WavWriter};
use segue::{DeckIndex, EngineCore, EngineEvent, StereoFrame};

static TRACING: Once = Once::new();

/// Route engine logs through the test harness; enable with RUST_LOG.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Low fixture rate keeps decode and scan fast.
pub const FIXTURE_RATE: u32 = 8000;

/// Render block size used by the manual driver.
pub const BLOCK_FRAMES: usize = 256;

/// Amplitude of the main tone segment.
pub const TONE_AMP: f32 = 0.5;

/// -50 dBFS: below the -45 dBFS ending threshold, above the -60 dBFS
/// silence threshold.
pub const TAIL_AMP: f32 = 0.00316;

/// Write a stereo WAV shaped `[lead silence][tone][quiet tail][silence]`.
///
/// With the scanner's thresholds this yields, approximately:
/// - first audible = `lead`
/// - last audible  = `lead + tone`
/// - end of content = `lead + tone + tail` (file end when `tail` is 0)
pub fn write_track(
    path: &Path,
    rate: u32,
    lead_secs: f64,
    tone_secs: f64,
    tail_secs: f64,
    silence_secs: f64,
) {
    let spec = WavSpec {
        channels: 2,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();

    let mut write_span = |secs: f64, amp: f32| {
        let frames = (secs * rate as f64) as usize;
        for i in 0..frames {
            let t = i as f32 / rate as f32;
            let sample = ((2.0 * PI * 220.0 * t).sin() * amp * i16::MAX as f32) as i16;
            writer.write_sample(sample).unwrap();
            writer.write_sample(sample).unwrap();
        }
    };

    write_span(lead_secs, 0.0);
    write_span(tone_secs, TONE_AMP);
    write_span(tail_secs, TAIL_AMP);
    write_span(silence_secs, 0.0);
    writer.finalize().unwrap();
}

/// A file of bytes no decoder will accept.
pub fn write_corrupt(path: &Path) {
    std::fs::write(path, b"definitely not an audio container").unwrap();
}

/// Event log captured from the engine listener.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install this log as the core's listener.
    pub fn install(&self, core: &Arc<EngineCore>) {
        let events = Arc::clone(&self.events);
        core.set_listener(Some(Box::new(move |event: EngineEvent| {
            events.lock().unwrap().push(event);
        })));
    }

    pub fn snapshot(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&EngineEvent) -> bool) -> usize {
        self.snapshot().iter().filter(|e| predicate(e)).count()
    }

    pub fn any(&self, predicate: impl Fn(&EngineEvent) -> bool) -> bool {
        self.count(predicate) > 0
    }

    /// Index of the first event matching `predicate`.
    pub fn position_of(&self, predicate: impl Fn(&EngineEvent) -> bool) -> Option<usize> {
        self.snapshot().iter().position(|e| predicate(e))
    }
}

pub fn is_loaded(deck: DeckIndex) -> impl Fn(&EngineEvent) -> bool {
    move |e| matches!(e, EngineEvent::DeckLoaded { deck: d } if *d == deck)
}

pub fn is_unloaded(deck: DeckIndex) -> impl Fn(&EngineEvent) -> bool {
    move |e| matches!(e, EngineEvent::DeckUnloaded { deck: d } if *d == deck)
}

pub fn is_started(deck: DeckIndex) -> impl Fn(&EngineEvent) -> bool {
    move |e| matches!(e, EngineEvent::DeckStarted { deck: d } if *d == deck)
}

pub fn is_finished(deck: DeckIndex) -> impl Fn(&EngineEvent) -> bool {
    move |e| matches!(e, EngineEvent::DeckFinished { deck: d } if *d == deck)
}

pub fn is_position(deck: DeckIndex) -> impl Fn(&EngineEvent) -> bool {
    move |e| matches!(e, EngineEvent::DeckPosition { deck: d, .. } if *d == deck)
}

pub fn is_pre_cue(event: &EngineEvent) -> bool {
    matches!(event, EngineEvent::PreCueNext)
}

pub fn is_device_changed(event: &EngineEvent) -> bool {
    matches!(event, EngineEvent::AudioDeviceChanged)
}

/// Manual render driver standing in for the audio device thread.
pub struct Driver {
    core: Arc<EngineCore>,
    block: Vec<StereoFrame>,
}

impl Driver {
    pub fn new(core: Arc<EngineCore>) -> Self {
        init_tracing();
        Self {
            core,
            block: vec![StereoFrame::ZERO; BLOCK_FRAMES],
        }
    }

    /// Render one block and give the control/load threads a moment to run.
    pub fn step(&mut self) -> &[StereoFrame] {
        self.core.render(&mut self.block);
        std::thread::sleep(Duration::from_micros(300));
        &self.block
    }

    /// Render until `predicate` holds, up to `max_blocks`. Returns true on
    /// success.
    pub fn run_until(&mut self, max_blocks: usize, predicate: impl Fn() -> bool) -> bool {
        for _ in 0..max_blocks {
            if predicate() {
                return true;
            }
            self.step();
        }
        predicate()
    }

    /// Idle (no rendering) until `predicate` holds; for load waits.
    pub fn wait_until(&mut self, timeout: Duration, predicate: impl Fn() -> bool) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        predicate()
    }
}

/// Temp-dir fixture set builder.
pub struct FixtureDir {
    pub dir: tempfile::TempDir,
}

impl FixtureDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}
