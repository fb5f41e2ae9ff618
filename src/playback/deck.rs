//! Deck: one of the two playback slots
//!
//! A deck is created once at engine start and reused across tracks. While a
//! track is loaded the deck owns its decode chain (read-ahead ring +
//! resampler), the audible-region anchors, and the play state. The render
//! hot path runs on the audio thread and takes only the chain mutex, whose
//! other holders do nothing but O(1) pointer swaps.
//!
//! Loading and scanning run on the serial loading worker; the deck publishes
//! results atomically and emits lifecycle messages into the control channel.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::decoder::TrackDecoder;
use crate::audio::resampler::StreamResampler;
use crate::audio::types::{db_to_gain, StereoFrame};
use crate::config::{AtomicF32, SettingsHandle, CUE_EPSILON_SECS, PRE_CUE_EPSILON_SECS, RAMP_FRAMES};
use crate::error::{Error, Result};
use crate::events::{ControlMsg, DeckIndex};
use crate::playback::read_ahead::ReadAheadReader;
use crate::playback::scanner::{self, AudibleRegion};
use crate::playback::workers::{PoolRegistry, WorkerJob};
use crate::track::Track;

/// Deck lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeckState {
    Empty,
    Loading,
    Loaded,
    Playing,
    Paused,
}

const STATE_EMPTY: u8 = 0;
const STATE_LOADING: u8 = 1;
const STATE_LOADED: u8 = 2;
const STATE_PLAYING: u8 = 3;
const STATE_PAUSED: u8 = 4;

fn state_from_u8(value: u8) -> DeckState {
    match value {
        STATE_LOADING => DeckState::Loading,
        STATE_LOADED => DeckState::Loaded,
        STATE_PLAYING => DeckState::Playing,
        STATE_PAUSED => DeckState::Paused,
        _ => DeckState::Empty,
    }
}

/// Derived transition anchor positions, seconds from file start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeckAnchors {
    /// Time from file start to the first audible frame.
    pub leading: f64,
    /// Time from the end of audible content to the file end.
    pub trailing: f64,
    /// Where the outgoing fade begins.
    pub transition_start: f64,
    /// Where the outgoing fade completes.
    pub transition_end: f64,
    /// Where the next track is loaded.
    pub cue: f64,
    /// Where listeners are told to make a selection decision.
    pub pre_cue: f64,
    /// First audible frame, seconds.
    pub first_audible: f64,
}

/// Shared output-device parameters decks follow lazily.
pub(crate) struct DeviceParams {
    pub rate: AtomicU32,
}

impl DeviceParams {
    pub fn new(rate: u32) -> Arc<Self> {
        Arc::new(Self {
            rate: AtomicU32::new(rate),
        })
    }
}

struct TrackMeta {
    id: Uuid,
    region: AudibleRegion,
    /// Forced transition window installed by `fade_out`.
    fade_override: Option<(f64, f64)>,
    sample_rate: u32,
}

struct Chain {
    reader: ReadAheadReader,
    resampler: StreamResampler,
    chunk: Vec<StereoFrame>,
    last_gain: f32,
    pre_gain: f32,
}

pub(crate) struct DeckShared {
    index: DeckIndex,
    control_tx: Sender<ControlMsg>,
    settings: SettingsHandle,
    device: Arc<DeviceParams>,
    load_tx: Sender<WorkerJob>,
    registry: PoolRegistry,

    state: AtomicU8,
    playing: AtomicBool,
    paused: AtomicBool,
    /// Audio thread acknowledged that it renders silence.
    stopped: AtomicBool,
    stop_requested: AtomicBool,
    /// Invalidates in-flight loads and scans.
    load_gen: AtomicU64,

    gain: AtomicF32,
    is_main: AtomicBool,

    position_frames: AtomicU64,
    sample_rate: AtomicU32,
    total_frames: AtomicU64,
    end_frame: AtomicU64,

    meta: Mutex<Option<TrackMeta>>,
    chain: Mutex<Option<Chain>>,
}

/// Handle to one playback slot. Cheap to clone.
#[derive(Clone)]
pub struct Deck {
    shared: Arc<DeckShared>,
}

/// A queued load for the serial loading worker.
pub(crate) struct LoadTask {
    shared: Arc<DeckShared>,
    track: Arc<dyn Track>,
    autoplay: bool,
    gen: u64,
}

/// A queued audible-region scan.
pub(crate) struct ScanTask {
    shared: Arc<DeckShared>,
    track: Arc<dyn Track>,
    first_audible: u64,
    gen: u64,
}

impl Deck {
    pub(crate) fn new(
        index: DeckIndex,
        control_tx: Sender<ControlMsg>,
        settings: SettingsHandle,
        device: Arc<DeviceParams>,
        load_tx: Sender<WorkerJob>,
        registry: PoolRegistry,
    ) -> Deck {
        Deck {
            shared: Arc::new(DeckShared {
                index,
                control_tx,
                settings,
                device,
                load_tx,
                registry,
                state: AtomicU8::new(STATE_EMPTY),
                playing: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                stopped: AtomicBool::new(true),
                stop_requested: AtomicBool::new(false),
                load_gen: AtomicU64::new(0),
                gain: AtomicF32::new(1.0),
                is_main: AtomicBool::new(false),
                position_frames: AtomicU64::new(0),
                sample_rate: AtomicU32::new(0),
                total_frames: AtomicU64::new(0),
                end_frame: AtomicU64::new(0),
                meta: Mutex::new(None),
                chain: Mutex::new(None),
            }),
        }
    }

    pub fn index(&self) -> DeckIndex {
        self.shared.index
    }

    pub fn state(&self) -> DeckState {
        state_from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Schedule a track load. Fails fast when a load is already in flight.
    pub fn load(&self, track: Arc<dyn Track>, autoplay: bool) -> Result<()> {
        if self.state() == DeckState::Loading {
            return Err(Error::Busy {
                deck: self.shared.index.name(),
            });
        }
        self.load_internal(track, autoplay);
        Ok(())
    }

    /// Schedule a load unconditionally, superseding any in-flight load.
    ///
    /// Used by the transition controller, which owns busy-handling.
    pub(crate) fn load_internal(&self, track: Arc<dyn Track>, autoplay: bool) {
        let shared = &self.shared;
        let gen = shared.load_gen.fetch_add(1, Ordering::SeqCst) + 1;
        shared.state.store(STATE_LOADING, Ordering::Release);
        debug!("{}: load scheduled for {}", shared.index, track.display_name());
        let _ = shared.load_tx.send(WorkerJob::Load(LoadTask {
            shared: Arc::clone(shared),
            track,
            autoplay,
            gen,
        }));
    }

    /// Release the decoder, buffers, and anchors. Idempotent.
    pub fn unload(&self) {
        let shared = &self.shared;
        // Invalidate any in-flight load or scan.
        shared.load_gen.fetch_add(1, Ordering::SeqCst);

        let (had_track, chain) = {
            let mut meta = shared.meta.lock().unwrap();
            let mut chain = shared.chain.lock().unwrap();
            let had_track = meta.is_some();
            let chain = chain.take();
            *meta = None;

            shared.playing.store(false, Ordering::Release);
            shared.paused.store(false, Ordering::Release);
            shared.stop_requested.store(false, Ordering::Release);
            shared.stopped.store(true, Ordering::Release);
            shared.position_frames.store(0, Ordering::Release);
            shared.sample_rate.store(0, Ordering::Release);
            shared.total_frames.store(0, Ordering::Release);
            shared.end_frame.store(0, Ordering::Release);
            shared.state.store(STATE_EMPTY, Ordering::Release);

            (had_track, chain)
        };

        // Decoder and ring teardown happens off the lock.
        drop(chain);

        if had_track {
            info!("{}: unloaded", shared.index);
            let _ = shared.control_tx.send(ControlMsg::Unloaded {
                deck: shared.index,
            });
        }
    }

    /// Begin producing audio. No-op unless a track is loaded.
    pub fn start(&self) {
        let shared = &self.shared;
        match self.state() {
            DeckState::Loaded | DeckState::Paused => {
                shared.paused.store(false, Ordering::Release);
                shared.stop_requested.store(false, Ordering::Release);
                shared.playing.store(true, Ordering::Release);
                shared.stopped.store(false, Ordering::Release);
                shared.state.store(STATE_PLAYING, Ordering::Release);
                info!("{}: started", shared.index);
                let _ = shared.control_tx.send(ControlMsg::Started {
                    deck: shared.index,
                });
            }
            _ => {}
        }
    }

    /// Request a click-free stop and wait (bounded) for the audio thread to
    /// acknowledge. Never blocks longer than one second.
    pub fn stop(&self) {
        let shared = &self.shared;
        if !shared.playing.load(Ordering::Acquire) {
            return;
        }

        shared.stop_requested.store(true, Ordering::Release);

        let mut polls = 500;
        while polls > 0 && !shared.stopped.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(2));
            polls -= 1;
        }
        if polls == 0 {
            warn!("{}: stop not acknowledged within timeout", shared.index);
        }
    }

    /// Pause rendering, freezing the read position.
    pub fn pause(&self) {
        if self.state() == DeckState::Playing {
            self.shared.paused.store(true, Ordering::Release);
            self.shared.state.store(STATE_PAUSED, Ordering::Release);
        }
    }

    /// Resume from pause.
    pub fn resume(&self) {
        if self.state() == DeckState::Paused {
            self.shared.paused.store(false, Ordering::Release);
            self.shared.state.store(STATE_PLAYING, Ordering::Release);
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(
            self.state(),
            DeckState::Loaded | DeckState::Playing | DeckState::Paused
        )
    }

    pub(crate) fn is_loading(&self) -> bool {
        self.state() == DeckState::Loading
    }

    pub fn is_playing(&self) -> bool {
        self.state() == DeckState::Playing
    }

    pub fn is_main(&self) -> bool {
        self.shared.is_main.load(Ordering::Acquire)
    }

    pub(crate) fn set_main(&self, main: bool) {
        self.shared.is_main.store(main, Ordering::Release);
    }

    /// Deck volume in [0, 1], applied as a per-block ramp.
    pub fn set_volume(&self, volume: f32) {
        self.shared.gain.store(volume.clamp(0.0, 1.0));
    }

    pub fn volume(&self) -> f32 {
        self.shared.gain.load()
    }

    /// Correlation id of the loaded track, if any.
    pub fn track_id(&self) -> Option<Uuid> {
        self.shared.meta.lock().unwrap().as_ref().map(|m| m.id)
    }

    pub fn position_seconds(&self) -> f64 {
        let rate = self.shared.sample_rate.load(Ordering::Acquire);
        if rate == 0 {
            return 0.0;
        }
        self.shared.position_frames.load(Ordering::Acquire) as f64 / rate as f64
    }

    pub fn duration_seconds(&self) -> f64 {
        let rate = self.shared.sample_rate.load(Ordering::Acquire);
        if rate == 0 {
            return 0.0;
        }
        self.shared.total_frames.load(Ordering::Acquire) as f64 / rate as f64
    }

    /// Seek to an absolute position; clamps to the track bounds. No-op on an
    /// empty deck.
    pub fn set_position_seconds(&self, seconds: f64) {
        let shared = &self.shared;
        let rate = shared.sample_rate.load(Ordering::Acquire);
        if rate == 0 {
            return;
        }
        let total = shared.total_frames.load(Ordering::Acquire);
        let frame = ((seconds.max(0.0) * rate as f64) as u64).min(total);

        let mut chain = shared.chain.lock().unwrap();
        if let Some(chain) = chain.as_mut() {
            chain.reader.seek(frame);
            chain.resampler.flush();
            shared.position_frames.store(frame, Ordering::Release);
            debug!("{}: seek to {:.2}s", shared.index, seconds);
        }
    }

    pub fn set_position_fraction(&self, fraction: f64) {
        let duration = self.duration_seconds();
        self.set_position_seconds(duration * fraction.clamp(0.0, 1.0));
    }

    /// Time from file start to the first audible frame (0 when empty).
    pub fn leading_duration(&self) -> f64 {
        self.anchors().map(|a| a.leading).unwrap_or(0.0)
    }

    /// Derived transition anchors. None while no track is loaded.
    pub fn anchors(&self) -> Option<DeckAnchors> {
        let meta = self.shared.meta.lock().unwrap();
        let meta = meta.as_ref()?;
        let rate = meta.sample_rate as f64;
        if rate <= 0.0 {
            return None;
        }

        let region = meta.region;
        let natural_end = region.end_frame as f64 / rate;
        let tail = region.end_frame.saturating_sub(region.last_audible) as f64 / rate;
        let natural_start = natural_end - self.shared.settings.max_transition_time().min(tail);

        let (transition_start, transition_end) = meta
            .fade_override
            .unwrap_or((natural_start, natural_end));

        let cue = (transition_start - CUE_EPSILON_SECS).max(0.0);
        let pre_cue = (cue - PRE_CUE_EPSILON_SECS).max(0.0);

        Some(DeckAnchors {
            leading: region.first_audible as f64 / rate,
            trailing: region.total_frames.saturating_sub(region.end_frame) as f64 / rate,
            transition_start,
            transition_end,
            cue,
            pre_cue,
            first_audible: region.first_audible as f64 / rate,
        })
    }

    /// Force the transition window to open at `start`. Installed by the
    /// engine's `fade_out`.
    pub(crate) fn install_fade_override(&self, start: f64, end: f64) {
        let mut meta = self.shared.meta.lock().unwrap();
        if let Some(meta) = meta.as_mut() {
            meta.fade_override = Some((start, end));
            debug!(
                "{}: forced transition window {:.2}s..{:.2}s",
                self.shared.index, start, end
            );
        }
    }

    /// Render one block on the audio thread. Returns true when the deck
    /// contributed audible content (i.e. it is playing).
    pub(crate) fn render_block(&self, out: &mut [StereoFrame]) -> bool {
        let shared = &self.shared;

        let mut guard = shared.chain.lock().unwrap();
        let Some(chain) = guard.as_mut() else {
            out.fill(StereoFrame::ZERO);
            shared.stopped.store(true, Ordering::Release);
            return false;
        };

        let was_playing = shared.playing.load(Ordering::Acquire);
        let stop_requested = shared.stop_requested.swap(false, Ordering::AcqRel);
        let paused = shared.paused.load(Ordering::Acquire);

        if stop_requested && was_playing && paused {
            // Already silent; acknowledge immediately.
            shared.playing.store(false, Ordering::Release);
            shared.stopped.store(true, Ordering::Release);
            out.fill(StereoFrame::ZERO);
            let _ = shared.control_tx.send(ControlMsg::Finished {
                deck: shared.index,
            });
            return false;
        }

        if !was_playing || paused {
            out.fill(StereoFrame::ZERO);
            if !was_playing {
                shared.stopped.store(true, Ordering::Release);
            }
            return false;
        }

        // Follow device format changes lazily.
        let device_rate = shared.device.rate.load(Ordering::Acquire);
        if chain.resampler.device_rate() != device_rate {
            if let Err(e) = chain.resampler.set_device_rate(device_rate) {
                warn!("{}: resampler re-prepare failed: {e}", shared.index);
            }
        }

        // Pull frames through resampler and read-ahead.
        let chunk_frames = chain.resampler.chunk_frames();
        if chain.chunk.len() < chunk_frames {
            chain.chunk.resize(chunk_frames, StereoFrame::ZERO);
        }
        let mut filled = 0;
        while filled < out.len() {
            if let Some(frame) = chain.resampler.pop() {
                out[filled] = frame;
                filled += 1;
                continue;
            }
            chain.reader.read(&mut chain.chunk[..chunk_frames]);
            if chain
                .resampler
                .push_chunk(&chain.chunk[..chunk_frames])
                .is_err()
            {
                out[filled..].fill(StereoFrame::ZERO);
                break;
            }
        }

        shared
            .position_frames
            .store(chain.reader.position(), Ordering::Release);

        if stop_requested {
            // Fade the head of this block to zero and silence the rest.
            let ramp = RAMP_FRAMES.min(out.len());
            for (i, frame) in out[..ramp].iter_mut().enumerate() {
                *frame = frame.scaled(1.0 - (i as f32 + 1.0) / ramp as f32);
            }
            out[ramp..].fill(StereoFrame::ZERO);
            shared.playing.store(false, Ordering::Release);
        } else {
            // End of audible content.
            let end = shared.end_frame.load(Ordering::Acquire);
            if chain.reader.position() > end + 1 {
                shared.playing.store(false, Ordering::Release);
            }
        }

        // Per-block gain ramp avoids zipper noise on volume changes.
        let target = shared.gain.load() * chain.pre_gain;
        let start_gain = chain.last_gain;
        if (target - start_gain).abs() < 1e-6 {
            if (target - 1.0).abs() > 1e-6 {
                for frame in out.iter_mut() {
                    *frame = frame.scaled(target);
                }
            }
        } else {
            let n = out.len() as f32;
            for (i, frame) in out.iter_mut().enumerate() {
                let g = start_gain + (target - start_gain) * ((i as f32 + 1.0) / n);
                *frame = frame.scaled(g);
            }
        }
        chain.last_gain = target;

        if !shared.playing.load(Ordering::Acquire) {
            shared.stopped.store(true, Ordering::Release);
            let _ = shared.control_tx.send(ControlMsg::Finished {
                deck: shared.index,
            });
            return true; // this block still carried (ramped) content
        }

        true
    }
}

/// Execute a queued load on the loading worker.
pub(crate) fn perform_load(task: LoadTask, scan_tx: &Sender<WorkerJob>) {
    let shared = &task.shared;
    let current = |gen: u64| shared.load_gen.load(Ordering::SeqCst) == gen;

    if !current(task.gen) {
        debug!("{}: load superseded before start", shared.index);
        return;
    }

    let name = task.track.display_name();
    let mut decoder = match TrackDecoder::open(&*task.track) {
        Ok(decoder) => decoder,
        Err(e) => {
            warn!("{}: load failed for {name}: {e}", shared.index);
            if current(task.gen) {
                shared.state.store(STATE_EMPTY, Ordering::Release);
                let _ = shared.control_tx.send(ControlMsg::LoadFailed {
                    deck: shared.index,
                    autoplay: task.autoplay,
                });
            }
            return;
        }
    };

    let first_audible = match scanner::quick_first_audible(&mut decoder) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("{}: leading-silence scan failed for {name}: {e}", shared.index);
            0
        }
    };

    if !current(task.gen) {
        debug!("{}: load canceled for {name}", shared.index);
        return;
    }

    let sample_rate = decoder.sample_rate();
    let total_frames = decoder.total_frames();
    let device_rate = shared.device.rate.load(Ordering::Acquire);

    let resampler = match StreamResampler::new(sample_rate, device_rate) {
        Ok(resampler) => resampler,
        Err(e) => {
            warn!("{}: resampler init failed for {name}: {e}", shared.index);
            if current(task.gen) {
                shared.state.store(STATE_EMPTY, Ordering::Release);
                let _ = shared.control_tx.send(ControlMsg::LoadFailed {
                    deck: shared.index,
                    autoplay: task.autoplay,
                });
            }
            return;
        }
    };

    let (fill_task, reader) = ReadAheadReader::new(decoder, first_audible);
    let pre_gain = task.track.pre_gain_db().map(db_to_gain).unwrap_or(1.0);
    let track_id = Uuid::new_v4();

    let had_track;
    let old_chain;
    {
        let mut meta = shared.meta.lock().unwrap();
        let mut chain = shared.chain.lock().unwrap();
        if !current(task.gen) {
            debug!("{}: load canceled during publish for {name}", shared.index);
            return;
        }

        had_track = meta.is_some();
        old_chain = chain.take();

        *meta = Some(TrackMeta {
            id: track_id,
            region: AudibleRegion::provisional(first_audible, total_frames),
            fade_override: None,
            sample_rate,
        });
        *chain = Some(Chain {
            reader,
            resampler,
            chunk: Vec::new(),
            last_gain: 0.0,
            pre_gain,
        });

        shared.sample_rate.store(sample_rate, Ordering::Release);
        shared.total_frames.store(total_frames, Ordering::Release);
        shared.end_frame.store(total_frames, Ordering::Release);
        shared.position_frames.store(first_audible, Ordering::Release);
        shared.playing.store(false, Ordering::Release);
        shared.paused.store(false, Ordering::Release);
        shared.stop_requested.store(false, Ordering::Release);
        shared.stopped.store(true, Ordering::Release);
        shared.gain.store(1.0);
        shared.state.store(STATE_LOADED, Ordering::Release);
    }

    // Previous track's chain tears down off the locks; its unload event
    // precedes the new track's loaded event.
    drop(old_chain);
    if had_track {
        let _ = shared.control_tx.send(ControlMsg::Unloaded {
            deck: shared.index,
        });
    }

    shared.registry.register(&fill_task);

    info!(
        track = %track_id,
        rate = sample_rate,
        frames = total_frames,
        "{}: loaded {name}",
        shared.index
    );

    let _ = shared.control_tx.send(ControlMsg::Loaded {
        deck: shared.index,
        track_id,
        autoplay: task.autoplay,
    });

    let _ = scan_tx.send(WorkerJob::Scan(ScanTask {
        shared: Arc::clone(shared),
        track: task.track,
        first_audible,
        gen: task.gen,
    }));
}

/// Execute a queued audible-region scan on the loading worker.
///
/// Opens an independent reader; failure keeps the provisional full-file
/// anchors and is non-fatal.
pub(crate) fn perform_scan(task: ScanTask) {
    let shared = &task.shared;
    if shared.load_gen.load(Ordering::SeqCst) != task.gen {
        return;
    }

    let mut decoder = match TrackDecoder::open(&*task.track) {
        Ok(decoder) => decoder,
        Err(e) => {
            warn!(
                "{}: scan reader unavailable, keeping full-file anchors: {e}",
                shared.index
            );
            return;
        }
    };

    let region = match scanner::scan_track(&mut decoder, task.first_audible) {
        Ok(region) => region,
        Err(e) => {
            warn!("{}: audible-region scan failed: {e}", shared.index);
            return;
        }
    };

    // Publish atomically; a reload or unload since scheduling wins.
    let mut meta = shared.meta.lock().unwrap();
    if shared.load_gen.load(Ordering::SeqCst) != task.gen {
        return;
    }
    if let Some(meta) = meta.as_mut() {
        meta.region = region;
        shared.end_frame.store(region.end_frame, Ordering::Release);
        debug!(
            track = %meta.id,
            first = region.first_audible,
            last = region.last_audible,
            end = region.end_frame,
            "{}: scan complete",
            shared.index
        );
    }
}
