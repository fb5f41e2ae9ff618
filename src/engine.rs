//! The engine: deck wiring, control thread, and device binding
//!
//! `EngineCore` owns the two decks, the mixer, the transition controller,
//! and the worker runtime; its `render` method is the audio callback target
//! and can equally be driven by hand (tests, offline rendering). `Engine`
//! binds a core to a cpal output device and carries the caller-facing
//! surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{info, warn};

use crate::audio::output::{self, AudioOutput, DeviceSelector, DeviceTypeInfo};
use crate::audio::types::{LevelReading, StereoFrame};
use crate::config::{Settings, SettingsHandle, SettingsSnapshot};
use crate::error::Result;
use crate::events::{ControlMsg, DeckIndex, EngineEvent, EngineListener};
use crate::playback::deck::{Deck, DeviceParams};
use crate::playback::level::LevelTracker;
use crate::playback::mixer::{Mixer, PostProcessor};
use crate::playback::transition::{self, ControlState, Ctx, TransitionState};
use crate::playback::workers::WorkerRuntime;
use crate::track::TrackQueue;

/// Visualization tick period (~200 Hz peak decay).
const LEVEL_DECAY_TICK: Duration = Duration::from_millis(5);

struct EngineThreads {
    workers: Option<WorkerRuntime>,
    control: Option<JoinHandle<()>>,
    visualization: Option<JoinHandle<()>>,
}

/// Device-independent engine core.
///
/// All state transitions are serialized on the control thread; the audio
/// thread only renders and posts messages.
pub struct EngineCore {
    decks: [Deck; 2],
    mixer: Mixer,
    settings: SettingsHandle,
    levels: LevelTracker,
    device: Arc<DeviceParams>,
    control_tx: Sender<ControlMsg>,
    state: Mutex<ControlState>,
    queue: Mutex<Box<dyn TrackQueue>>,
    listener: Mutex<Option<Box<dyn EngineListener>>>,
    threads: Mutex<EngineThreads>,
    shutting_down: AtomicBool,
}

impl EngineCore {
    /// Build a core with the default settings and a 44.1 kHz output rate.
    pub fn new(queue: Box<dyn TrackQueue>) -> Arc<EngineCore> {
        Self::with_settings(queue, SettingsSnapshot::default(), 44_100)
    }

    /// Build a core with explicit settings and output rate.
    pub fn with_settings(
        queue: Box<dyn TrackQueue>,
        snapshot: SettingsSnapshot,
        device_rate: u32,
    ) -> Arc<EngineCore> {
        let settings = Settings::new(snapshot);
        let device = DeviceParams::new(device_rate);
        let (control_tx, control_rx) = unbounded::<ControlMsg>();

        let workers = WorkerRuntime::spawn();
        let decks = [
            Deck::new(
                DeckIndex::A,
                control_tx.clone(),
                Arc::clone(&settings),
                Arc::clone(&device),
                workers.load_tx(),
                workers.registry(),
            ),
            Deck::new(
                DeckIndex::B,
                control_tx.clone(),
                Arc::clone(&settings),
                Arc::clone(&device),
                workers.load_tx(),
                workers.registry(),
            ),
        ];

        let core = Arc::new(EngineCore {
            mixer: Mixer::new(Arc::clone(&settings)),
            decks,
            settings,
            levels: LevelTracker::new(),
            device,
            control_tx,
            state: Mutex::new(ControlState::new()),
            queue: Mutex::new(queue),
            listener: Mutex::new(None),
            threads: Mutex::new(EngineThreads {
                workers: Some(workers),
                control: None,
                visualization: None,
            }),
            shutting_down: AtomicBool::new(false),
        });

        core.spawn_control_thread(control_rx);
        core.spawn_visualization_thread();
        core
    }

    fn spawn_control_thread(self: &Arc<Self>, rx: Receiver<ControlMsg>) {
        let weak = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("segue-control".to_string())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    if matches!(msg, ControlMsg::Shutdown) {
                        break;
                    }
                    let Some(core) = weak.upgrade() else { break };
                    core.handle_msg(msg);
                }
            })
            .expect("failed to spawn control thread");
        self.threads.lock().unwrap().control = Some(handle);
    }

    fn spawn_visualization_thread(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("segue-levels".to_string())
            .spawn(move || loop {
                std::thread::sleep(LEVEL_DECAY_TICK);
                let Some(core) = weak.upgrade() else { break };
                if core.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                core.levels.decay();
            })
            .expect("failed to spawn visualization thread");
        self.threads.lock().unwrap().visualization = Some(handle);
    }

    fn ctx(&self) -> Ctx<'_> {
        Ctx {
            decks: &self.decks,
            settings: &self.settings,
            queue: &self.queue,
        }
    }

    fn handle_msg(&self, msg: ControlMsg) {
        let mut events = Vec::new();

        match msg {
            ControlMsg::Position { deck, position } => {
                events.push(EngineEvent::DeckPosition { deck, position });
                let mut state = self.state.lock().unwrap();
                transition::on_position(&mut state, &self.ctx(), &mut events, deck, position);
            }
            ControlMsg::Loaded { deck, autoplay, .. } => {
                let mut state = self.state.lock().unwrap();
                transition::on_loaded(&mut state, &self.ctx(), &mut events, deck, autoplay);
            }
            ControlMsg::LoadFailed { deck, autoplay } => {
                let mut state = self.state.lock().unwrap();
                transition::on_load_failed(&mut state, &self.ctx(), &mut events, deck, autoplay);
            }
            ControlMsg::Started { deck } => {
                events.push(EngineEvent::DeckStarted { deck });
            }
            ControlMsg::Finished { deck } => {
                events.push(EngineEvent::DeckFinished { deck });
                // Destruction is deferred off the audio thread to here.
                self.decks[deck.ordinal()].unload();
            }
            ControlMsg::Unloaded { deck } => {
                let mut state = self.state.lock().unwrap();
                transition::on_unloaded(&mut state, &self.ctx(), &mut events, deck);
            }
            ControlMsg::Play => {
                let mut state = self.state.lock().unwrap();
                transition::on_play(&mut state, &self.ctx());
            }
            ControlMsg::Notify(event) => events.push(event),
            ControlMsg::Shutdown => {}
        }

        // Dispatch outside the state lock; listeners may call back in.
        if !events.is_empty() {
            let mut listener = self.listener.lock().unwrap();
            if let Some(listener) = listener.as_mut() {
                for event in events {
                    listener.on_event(event);
                }
            }
        }
    }

    /// Render one stereo block. This is the audio device callback; tests and
    /// offline drivers call it directly.
    pub fn render(&self, out: &mut [StereoFrame]) {
        let rendered = self.mixer.render(&self.decks, &self.levels, out);
        for (i, deck) in self.decks.iter().enumerate() {
            if rendered[i] {
                let _ = self.control_tx.send(ControlMsg::Position {
                    deck: deck.index(),
                    position: deck.position_seconds(),
                });
            }
        }
    }

    /// Start playback: load from the queue when nothing is playing.
    pub fn play(&self) {
        let _ = self.control_tx.send(ControlMsg::Play);
    }

    /// Stop playback and release both decks. Waits (bounded) for the audio
    /// thread to acknowledge the stop ramps.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.keep_playing = false;
            state.transition = TransitionState::Idle;
            state.transiting = None;
            state.force_fade = 0;
        }
        for deck in &self.decks {
            deck.stop();
            deck.unload();
        }
        self.mixer.set_paused(false);
    }

    /// Toggle pause; returns the new paused state.
    pub fn toggle_pause(&self) -> bool {
        self.mixer.toggle_paused()
    }

    /// Force the main deck to fade out and hand over regardless of its
    /// natural transition timing.
    pub fn fade_out(&self) {
        let mut state = self.state.lock().unwrap();
        let Some(main) = state.main_deck() else {
            return;
        };
        let deck = &self.decks[main.ordinal()];
        let Some(anchors) = deck.anchors() else {
            return;
        };

        let position = deck.position_seconds();
        let max_transition = self.settings.max_transition_time();
        let end = (position + max_transition).min(anchors.transition_end.max(position));
        deck.install_fade_override(position, end);
        state.force_fade = state.force_fade.saturating_add(1);
        info!("{main}: forced fade out at {position:.2}s (until {end:.2}s)");
    }

    /// Seek the main deck to an absolute position in seconds.
    pub fn seek(&self, seconds: f64) {
        if let Some(main) = self.main_deck() {
            self.decks[main.ordinal()].set_position_seconds(seconds);
        }
    }

    /// Seek the main deck to a fraction of its duration.
    pub fn seek_fraction(&self, fraction: f64) {
        if let Some(main) = self.main_deck() {
            self.decks[main.ordinal()].set_position_fraction(fraction);
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().unwrap().keep_playing
    }

    pub fn is_paused(&self) -> bool {
        self.mixer.is_paused()
    }

    /// Position of the main deck, seconds.
    pub fn position(&self) -> f64 {
        self.main_deck()
            .map(|d| self.decks[d.ordinal()].position_seconds())
            .unwrap_or(0.0)
    }

    /// Duration of the main deck's track, seconds.
    pub fn duration(&self) -> f64 {
        self.main_deck()
            .map(|d| self.decks[d.ordinal()].duration_seconds())
            .unwrap_or(0.0)
    }

    pub fn level(&self) -> LevelReading {
        self.levels.reading()
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn deck(&self, index: DeckIndex) -> &Deck {
        &self.decks[index.ordinal()]
    }

    pub fn main_deck(&self) -> Option<DeckIndex> {
        self.state.lock().unwrap().main_deck()
    }

    pub fn transition_state(&self) -> TransitionState {
        self.state.lock().unwrap().transition
    }

    /// Register the single event listener, replacing any previous one.
    pub fn set_listener(&self, listener: Option<Box<dyn EngineListener>>) {
        *self.listener.lock().unwrap() = listener;
    }

    /// Install the post-summation processor chain.
    pub fn set_post_processor(&self, post: Option<PostProcessor>) {
        self.mixer.set_post_processor(post);
    }

    /// Follow an output format change: decks re-prepare their resamplers on
    /// the next block, listeners get a single `AudioDeviceChanged`.
    pub fn set_output_rate(&self, rate: u32) {
        let previous = self.device.rate.swap(rate, Ordering::AcqRel);
        if previous != rate {
            info!(from = previous, to = rate, "output sample rate changed");
            let _ = self
                .control_tx
                .send(ControlMsg::Notify(EngineEvent::AudioDeviceChanged));
        }
    }

    /// Stop all engine-owned threads. Called by `Engine::shutdown` and on
    /// drop of the last handle; idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        for deck in &self.decks {
            deck.unload();
        }

        let _ = self.control_tx.send(ControlMsg::Shutdown);
        let current = std::thread::current().id();
        let mut threads = self.threads.lock().unwrap();
        if let Some(handle) = threads.control.take() {
            // Joining our own thread would deadlock (possible when the last
            // handle is dropped from inside an event dispatch); the loop
            // exits on its own in that case.
            if handle.thread().id() != current && handle.join().is_err() {
                warn!("control thread panicked during shutdown");
            }
        }
        if let Some(mut workers) = threads.workers.take() {
            workers.shutdown();
        }
        if let Some(handle) = threads.visualization.take() {
            if handle.thread().id() != current && handle.join().is_err() {
                warn!("visualization thread panicked during shutdown");
            }
        }
    }
}

impl Drop for EngineCore {
    fn drop(&mut self) {
        // The owning threads hold only Weak references, so reaching drop
        // means no Engine handle remains; make sure they exit.
        self.shutdown();
    }
}

/// Device-bound engine facade: the caller-facing surface.
pub struct Engine {
    core: Arc<EngineCore>,
    output: Mutex<Option<AudioOutput>>,
}

impl Engine {
    /// Create an engine over the given track queue, bound to the default
    /// output device. An unopenable device is the only fatal construction
    /// error.
    pub fn new(queue: Box<dyn TrackQueue>) -> Result<Engine> {
        Self::with_settings(queue, SettingsSnapshot::default())
    }

    pub fn with_settings(queue: Box<dyn TrackQueue>, snapshot: SettingsSnapshot) -> Result<Engine> {
        let output = AudioOutput::open(&DeviceSelector::default())?;
        let core = EngineCore::with_settings(queue, snapshot, output.sample_rate());

        let engine = Engine {
            core,
            output: Mutex::new(Some(output)),
        };
        engine.start_stream()?;
        Ok(engine)
    }

    fn start_stream(&self) -> Result<()> {
        let mut guard = self.output.lock().unwrap();
        if let Some(output) = guard.as_mut() {
            let core = Arc::clone(&self.core);
            output.start(move |block: &mut [StereoFrame]| core.render(block))?;
        }
        Ok(())
    }

    /// The device-independent core (also the hook for embedders that drive
    /// rendering themselves).
    pub fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    pub fn play(&self) {
        self.core.play();
    }

    pub fn stop(&self) {
        self.core.stop();
    }

    /// Toggle pause; returns the new paused state.
    pub fn toggle_pause(&self) -> bool {
        self.core.toggle_pause()
    }

    pub fn fade_out(&self) {
        self.core.fade_out();
    }

    pub fn seek(&self, seconds: f64) {
        self.core.seek(seconds);
    }

    pub fn seek_fraction(&self, fraction: f64) {
        self.core.seek_fraction(fraction);
    }

    pub fn is_playing(&self) -> bool {
        self.core.is_playing()
    }

    pub fn is_paused(&self) -> bool {
        self.core.is_paused()
    }

    pub fn position(&self) -> f64 {
        self.core.position()
    }

    pub fn duration(&self) -> f64 {
        self.core.duration()
    }

    pub fn level(&self) -> LevelReading {
        self.core.level()
    }

    pub fn gain(&self) -> f32 {
        self.core.settings().gain()
    }

    pub fn set_gain(&self, gain: f32) {
        self.core.settings().set_gain(gain);
    }

    pub fn fading_curve(&self) -> f64 {
        self.core.settings().fading_curve()
    }

    pub fn set_fading_curve(&self, curve: f64) {
        self.core.settings().set_fading_curve(curve);
    }

    pub fn max_transition_time(&self) -> f64 {
        self.core.settings().max_transition_time()
    }

    pub fn set_max_transition_time(&self, seconds: f64) {
        self.core.settings().set_max_transition_time(seconds);
    }

    pub fn max_leading_duration(&self) -> f64 {
        self.core.settings().max_leading_duration()
    }

    pub fn set_max_leading_duration(&self, seconds: f64) {
        self.core.settings().set_max_leading_duration(seconds);
    }

    pub fn set_listener(&self, listener: Option<Box<dyn EngineListener>>) {
        self.core.set_listener(listener);
    }

    /// Enumerate backends and devices, flagging the current one.
    pub fn list_devices(&self) -> Vec<DeviceTypeInfo> {
        let guard = self.output.lock().unwrap();
        let current = guard
            .as_ref()
            .map(|o| (o.host_name().to_string(), o.device_name().to_string()));
        output::list_devices(
            current
                .as_ref()
                .map(|(host, device)| (host.as_str(), device.as_str())),
        )
    }

    /// Switch the output device. Returns false when the selection could not
    /// be opened; the previous device keeps playing in that case.
    pub fn set_device(&self, selector: &DeviceSelector) -> bool {
        let mut new_output = match AudioOutput::open(selector) {
            Ok(output) => output,
            Err(e) => {
                warn!("set_device failed: {e}");
                return false;
            }
        };

        let core = Arc::clone(&self.core);
        if let Err(e) = new_output.start(move |block: &mut [StereoFrame]| core.render(block)) {
            warn!("set_device stream start failed: {e}");
            return false;
        }

        let mut guard = self.output.lock().unwrap();
        if let Some(mut old) = guard.replace(new_output) {
            old.stop();
        }
        let rate = guard.as_ref().map(|o| o.sample_rate()).unwrap_or(44_100);
        drop(guard);

        self.core.set_output_rate(rate);
        true
    }

    /// Recover from a dead output stream by reverting to the default
    /// device. Returns true when recovery succeeded.
    pub fn recover_device(&self) -> bool {
        let errored = {
            let guard = self.output.lock().unwrap();
            guard.as_ref().map(|o| o.has_error()).unwrap_or(false)
        };
        if !errored {
            return true;
        }
        warn!("output stream errored, reverting to default device");
        self.set_device(&DeviceSelector::default())
    }

    /// Tear the engine down: stops playback, the stream, and every
    /// engine-owned thread.
    pub fn shutdown(&self) {
        self.core.stop();
        if let Some(mut output) = self.output.lock().unwrap().take() {
            output.stop();
        }
        self.core.shutdown();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
