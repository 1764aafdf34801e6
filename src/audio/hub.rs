//! Audio hub
//!
//! Combines capture, playback and routing behind one state machine:
//!
//! ```text
//! unconfigured ─configure─▶ configuring ─ok─▶ stopped ─start─▶ starting ─▶ running
//!       ▲                        │               ▲                           │
//!       └────────failure─────────┘               └──────── stopping ◀──stop──┘
//! ```
//!
//! Graph resources only exist in the `Configured` arm of [`Graph`], and the
//! playback queue only once a clip has declared its format.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::audio::capture::{CaptureEngine, MicrophoneHandler};
use crate::audio::engine::{AudioEngine, RenderSource};
use crate::audio::format::{peak_db, AudioFormat, SoundClip};
use crate::audio::playback::{PlaybackQueue, PlaybackSettings};
use crate::audio::route::{AudioProfile, AudioRouteManager, MicrophoneMode, RouteEvent};
use crate::constants::{
    CAPTURE_QUEUE_DEPTH, DEFAULT_SAMPLE_RATE, ENGINE_HEALTH_INTERVAL_MS, FRAMES_PER_CHUNK, INPUT_CHANNELS,
};
use crate::error::AudioError;
use crate::state::StateCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioHubState {
    Unconfigured,
    Configuring,
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Hub tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubSettings {
    /// Microphone wire sample rate
    pub sample_rate: u32,
    pub frames_per_chunk: usize,
    pub capture_queue_depth: usize,
    pub playback: PlaybackSettings,
    pub output_metering: bool,
}

impl HubSettings {
    /// Wire format of microphone chunks
    pub fn wire_format(&self) -> AudioFormat {
        AudioFormat::pcm_i16(self.sample_rate, INPUT_CHANNELS)
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frames_per_chunk: FRAMES_PER_CHUNK,
            capture_queue_depth: CAPTURE_QUEUE_DEPTH,
            playback: PlaybackSettings::default(),
            output_metering: false,
        }
    }
}

/// One-shot hub notifications
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// Peak output level of one render block, in dBFS
    OutputMeter(f32),
    ClipEnqueued { id: String, index: Option<u32> },
    /// The signal graph was rebuilt after a hardware change
    Reconfigured,
    Route(RouteEvent),
    /// Non-fatal failure inside the hub
    Warning(AudioError),
}

struct ConfiguredGraph {
    profile: AudioProfile,
    capture: Option<CaptureEngine>,
    player: Option<Arc<PlaybackQueue>>,
}

enum Graph {
    Unconfigured,
    Configured(ConfiguredGraph),
}

struct HubInner {
    engine: Arc<dyn AudioEngine>,
    route: AudioRouteManager,
    settings: HubSettings,
    state: StateCell<AudioHubState>,
    graph: Mutex<Graph>,
    /// Serializes configure / start / stop / reconfigure
    op_lock: tokio::sync::Mutex<()>,
    mic_handler: Arc<RwLock<Option<MicrophoneHandler>>>,
    metering: Arc<AtomicBool>,
    events: broadcast::Sender<HubEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HubInner {
    fn drop(&mut self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
    }
}

/// Façade over capture, playback and routing. Cheap to clone.
#[derive(Clone)]
pub struct AudioHub {
    inner: Arc<HubInner>,
}

impl AudioHub {
    pub fn new(engine: Arc<dyn AudioEngine>, route: AudioRouteManager, settings: HubSettings) -> Self {
        tracing::info!("Initializing audio hub");
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(HubInner {
                engine,
                route,
                settings,
                state: StateCell::new("audio hub", AudioHubState::Unconfigured),
                graph: Mutex::new(Graph::Unconfigured),
                op_lock: tokio::sync::Mutex::new(()),
                mic_handler: Arc::new(RwLock::new(None)),
                metering: Arc::new(AtomicBool::new(settings.output_metering)),
                events,
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> AudioHubState {
        self.inner.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AudioHubState> {
        self.inner.state.subscribe()
    }

    /// Resolve once the hub reaches `target`
    pub async fn wait_for_state(&self, target: AudioHubState) -> AudioHubState {
        self.inner.state.wait_for(|s| *s == target).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }

    pub fn settings(&self) -> HubSettings {
        self.inner.settings
    }

    pub fn route(&self) -> &AudioRouteManager {
        &self.inner.route
    }

    pub fn profile(&self) -> Option<AudioProfile> {
        match &*self.inner.graph.lock() {
            Graph::Configured(graph) => Some(graph.profile),
            Graph::Unconfigured => None,
        }
    }

    /// Snapshot of the platform microphone mode
    pub fn microphone_mode(&self) -> MicrophoneMode {
        self.inner.route.microphone_mode()
    }

    pub fn set_output_metering(&self, enabled: bool) {
        self.inner.metering.store(enabled, Ordering::SeqCst);
    }

    pub fn is_output_metering_enabled(&self) -> bool {
        self.inner.metering.load(Ordering::SeqCst)
    }

    /// Register the consumer of microphone chunks, or clear it with `None`
    pub fn set_microphone_handler(&self, handler: Option<MicrophoneHandler>) {
        *self.inner.mic_handler.write() = handler;
    }

    pub fn has_microphone_handler(&self) -> bool {
        self.inner.mic_handler.read().is_some()
    }

    /// Build the graph for `profile`. Repeating the active profile is a no-op;
    /// switching profiles rebuilds the graph and is only allowed while stopped.
    pub async fn configure(&self, profile: AudioProfile) -> Result<(), AudioError> {
        tracing::info!("Configuring audio hub for {}", profile);
        let _op = self.inner.op_lock.lock().await;

        let state = self.state();
        let current = self.profile();
        match (state, current) {
            (AudioHubState::Unconfigured, _) => {}
            (_, Some(active)) if active == profile => {
                tracing::warn!("Audio hub already configured for {}", profile);
                return Ok(());
            }
            (AudioHubState::Stopped, Some(active)) => {
                tracing::info!("Switching audio hub from {} to {}", active, profile);
                self.teardown_graph();
            }
            (other, _) => {
                return Err(AudioError::Engine(format!(
                    "cannot reconfigure audio hub while {:?}",
                    other
                )));
            }
        }

        self.inner.state.set(AudioHubState::Configuring);
        match self.build_graph(profile) {
            Ok(graph) => {
                *self.inner.graph.lock() = Graph::Configured(graph);
                self.inner.state.set(AudioHubState::Stopped);
            }
            Err(e) => {
                tracing::error!("Audio hub configuration failed: {}", e);
                self.teardown_graph();
                self.inner.state.set(AudioHubState::Unconfigured);
                return Err(e);
            }
        }

        self.spawn_route_listener();
        Ok(())
    }

    /// Queue a clip for playback. The hub must be running.
    pub async fn enqueue(&self, clip: SoundClip) -> Result<(), AudioError> {
        if self.state() != AudioHubState::Running {
            tracing::warn!("Skipping enqueue because audio hub is not running");
            return Err(AudioError::NotRunning);
        }

        tracing::debug!("Enqueueing clip {} ({:?})", clip.id, clip.index);
        {
            let mut graph = self.inner.graph.lock();
            // stop clears the player under this lock once it has left running
            if self.state() != AudioHubState::Running {
                return Err(AudioError::NotRunning);
            }
            let Graph::Configured(graph) = &mut *graph else {
                return Err(AudioError::NotRunning);
            };

            match &clip.header {
                Some(header) => {
                    let format = header.audio_format()?;
                    let needs_player = graph
                        .player
                        .as_ref()
                        .map(|p| p.format().sample_rate != format.sample_rate)
                        .unwrap_or(true);
                    if needs_player {
                        self.install_player(graph, format)?;
                    }
                }
                None if graph.player.is_none() => {
                    tracing::warn!("Sound clip missing header and no player initialized");
                }
                None => {}
            }

            let player = graph.player.as_ref().ok_or(AudioError::SoundPlayerInitialization)?;
            player.enqueue(clip.headerless_data());
        }

        self.publish(HubEvent::ClipEnqueued {
            id: clip.id,
            index: clip.index,
        });
        Ok(())
    }

    /// Activate the route and start the engine. Only valid from stopped or
    /// stopping; anything else is ignored with a warning.
    pub async fn start(&self) -> Result<(), AudioError> {
        let _op = self.inner.op_lock.lock().await;

        let (previous, moved) = self.inner.state.transition(
            |s| matches!(s, AudioHubState::Stopped | AudioHubState::Stopping),
            AudioHubState::Starting,
        );
        if !moved {
            tracing::warn!("Attempted to start audio hub from {:?}", previous);
            return Ok(());
        }

        tracing::info!("Starting audio hub");
        match self.activate().await {
            Ok(()) => {
                self.inner.state.set(AudioHubState::Running);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Audio hub failed to start: {}", e);
                self.inner.state.set(AudioHubState::Stopped);
                Err(e)
            }
        }
    }

    /// Tear down playback and release the hardware. Waits out a concurrent
    /// start instead of dropping the request.
    pub async fn stop(&self) -> Result<(), AudioError> {
        tracing::info!("Stopping audio hub");
        match self.state() {
            AudioHubState::Starting => {
                tracing::warn!("Audio hub was starting, waiting to finish");
                self.inner
                    .state
                    .wait_for(|s| matches!(s, AudioHubState::Running | AudioHubState::Stopped))
                    .await;
            }
            AudioHubState::Running => {}
            other => {
                tracing::warn!("Attempted to stop audio hub from {:?}", other);
                return Ok(());
            }
        }

        let _op = self.inner.op_lock.lock().await;
        let (_, moved) = self
            .inner
            .state
            .transition(|s| s == AudioHubState::Running, AudioHubState::Stopping);
        if !moved {
            return Ok(());
        }

        self.set_microphone_handler(None);
        {
            let mut graph = self.inner.graph.lock();
            if let Graph::Configured(graph) = &mut *graph {
                if let Some(player) = graph.player.take() {
                    player.clear();
                }
                if let Some(capture) = graph.capture.as_ref() {
                    tracing::debug!(
                        "Microphone produced {} chunks, {} dropped",
                        capture.chunks_captured(),
                        capture.chunks_dropped()
                    );
                }
            }
        }
        self.inner.engine.disconnect_output();

        let engine = self.inner.engine.clone();
        let stopped = run_blocking(move || {
            engine.stop();
            Ok(())
        })
        .await;
        let deactivated = self.inner.route.stop().map_err(AudioError::from);

        self.inner.state.set(AudioHubState::Stopped);
        stopped.and(deactivated)
    }

    /// Drop pending playback immediately (user barge-in)
    pub fn handle_interruption(&self) {
        let graph = self.inner.graph.lock();
        match &*graph {
            Graph::Configured(ConfiguredGraph {
                player: Some(player),
                ..
            }) => player.clear(),
            _ => tracing::warn!("No sound player to clear"),
        }
    }

    pub fn mute_mic(&self, mute: bool) {
        let graph = self.inner.graph.lock();
        match &*graph {
            Graph::Configured(ConfiguredGraph {
                capture: Some(capture),
                ..
            }) => capture.set_muted(mute),
            _ => tracing::warn!("No microphone to mute"),
        }
    }

    pub fn is_mic_muted(&self) -> bool {
        match &*self.inner.graph.lock() {
            Graph::Configured(ConfiguredGraph {
                capture: Some(capture),
                ..
            }) => capture.is_muted(),
            _ => false,
        }
    }

    /// Bytes waiting in the playback queue
    pub fn pending_playback_bytes(&self) -> usize {
        match &*self.inner.graph.lock() {
            Graph::Configured(ConfiguredGraph {
                player: Some(player),
                ..
            }) => player.pending_bytes(),
            _ => 0,
        }
    }

    /// Rebuild graph connections after the hardware changed underneath us
    pub async fn reconfigure(&self) -> Result<(), AudioError> {
        let _op = self.inner.op_lock.lock().await;

        let state = self.state();
        if matches!(state, AudioHubState::Unconfigured | AudioHubState::Configuring) {
            tracing::warn!("Ignoring reconfigure while audio hub is {:?}", state);
            return Ok(());
        }

        tracing::debug!("Reconfiguring audio hub");
        let engine = self.inner.engine.clone();
        run_blocking(move || {
            engine.stop();
            Ok(())
        })
        .await?;

        {
            let mut graph = self.inner.graph.lock();
            let Graph::Configured(graph) = &mut *graph else {
                return Ok(());
            };
            self.inner.engine.disconnect_input();
            self.inner.engine.disconnect_output();

            if graph.capture.is_some() {
                let input_format = self.inner.engine.input_format()?;
                let stale = graph
                    .capture
                    .as_ref()
                    .map(|c| c.source_format() != input_format)
                    .unwrap_or(false);
                if stale {
                    tracing::info!("Input format changed to {}, rebuilding capture", input_format);
                    let capture = self.make_capture(input_format)?;
                    if let Some(old) = graph.capture.as_ref() {
                        capture.set_muted(old.is_muted());
                    }
                    graph.capture = Some(capture);
                } else if let Some(capture) = graph.capture.as_ref() {
                    // same format, but samples buffered from the old device are stale
                    capture.reset();
                }
                if let Some(capture) = graph.capture.as_ref() {
                    self.inner.engine.connect_input(capture.input_sink());
                }
            }
            if let Some(player) = graph.player.clone() {
                self.inner
                    .engine
                    .connect_output(player.format(), self.render_source(player))?;
            }
        }

        if self.state() == AudioHubState::Running {
            let engine = self.inner.engine.clone();
            run_blocking(move || engine.start()).await?;
        }
        self.publish(HubEvent::Reconfigured);
        Ok(())
    }

    async fn activate(&self) -> Result<(), AudioError> {
        self.inner.route.start()?;
        let engine = self.inner.engine.clone();
        run_blocking(move || engine.start()).await
    }

    fn build_graph(&self, profile: AudioProfile) -> Result<ConfiguredGraph, AudioError> {
        self.inner.route.configure(profile)?;
        self.inner.route.start()?;

        let capture = if profile.requires_microphone() {
            tracing::debug!("Initializing microphone");
            let input_format = self.inner.engine.input_format()?;
            let capture = self.make_capture(input_format)?;

            if let Err(e) = self.inner.engine.enable_voice_processing() {
                tracing::warn!("Voice processing unavailable, continuing without it: {}", e);
            }
            self.inner.engine.connect_input(capture.input_sink());
            Some(capture)
        } else {
            None
        };

        Ok(ConfiguredGraph {
            profile,
            capture,
            player: None,
        })
    }

    fn make_capture(&self, input_format: AudioFormat) -> Result<CaptureEngine, AudioError> {
        let settings = &self.inner.settings;
        let capture = CaptureEngine::new(
            input_format,
            settings.wire_format(),
            settings.frames_per_chunk,
            settings.capture_queue_depth,
        )?;

        let handler = self.inner.mic_handler.clone();
        capture.set_handler(Some(Arc::new(move |chunk| {
            let current = handler.read().clone();
            match current {
                Some(handler) => handler(chunk),
                None => tracing::trace!("No microphone handler registered"),
            }
        })));
        Ok(capture)
    }

    fn install_player(&self, graph: &mut ConfiguredGraph, format: AudioFormat) -> Result<(), AudioError> {
        tracing::info!("Initializing sound player for {}", format);
        let player = Arc::new(PlaybackQueue::new(format, self.inner.settings.playback));
        self.inner
            .engine
            .connect_output(format, self.render_source(player.clone()))
            .map_err(|e| {
                tracing::error!("Failed to connect sound player: {}", e);
                AudioError::SoundPlayerInitialization
            })?;
        graph.player = Some(player);
        Ok(())
    }

    fn render_source(&self, player: Arc<PlaybackQueue>) -> RenderSource {
        let metering = self.inner.metering.clone();
        let events = self.inner.events.clone();
        Arc::new(move |out: &mut [i16]| {
            player.render(out);
            if metering.load(Ordering::Relaxed) {
                let _ = events.send(HubEvent::OutputMeter(peak_db(out)));
            }
        })
    }

    fn teardown_graph(&self) {
        self.inner.engine.disconnect_input();
        self.inner.engine.disconnect_output();
        *self.inner.graph.lock() = Graph::Unconfigured;
    }

    fn spawn_route_listener(&self) {
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime, route changes will not reconfigure the hub");
            return;
        };

        let mut route_events = self.inner.route.subscribe();
        let weak: Weak<HubInner> = Arc::downgrade(&self.inner);
        *listener = Some(runtime.spawn(async move {
            let mut health = interval(Duration::from_millis(ENGINE_HEALTH_INTERVAL_MS));
            health.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    received = route_events.recv() => {
                        let event = match received {
                            Ok(event) => event,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!("Route listener lagged by {} events", skipped);
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        };
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        let hub = AudioHub { inner };

                        if event == RouteEvent::ConfigurationChanged {
                            if let Err(e) = hub.reconfigure().await {
                                tracing::error!("Audio hub reconfiguration failed: {}", e);
                                hub.publish(HubEvent::Warning(e));
                            }
                        }
                        hub.publish(HubEvent::Route(event));
                    }
                    _ = health.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        AudioHub { inner }.check_engine().await;
                    }
                }
            }
        }));
    }

    /// Report stream failures the engine collected and rebuild the graph
    /// if audio was supposed to be flowing
    async fn check_engine(&self) {
        let mut failed = false;
        while let Some(e) = self.inner.engine.take_error() {
            tracing::error!("Audio stream failed: {}", e);
            self.publish(HubEvent::Warning(e));
            failed = true;
        }
        if failed && self.state() == AudioHubState::Running {
            if let Err(e) = self.reconfigure().await {
                tracing::error!("Audio hub recovery failed: {}", e);
                self.publish(HubEvent::Warning(e));
            }
        }
    }

    fn publish(&self, event: HubEvent) {
        let _ = self.inner.events.send(event);
    }
}

/// Run a hardware call off the async workers
async fn run_blocking<F>(f: F) -> Result<(), AudioError>
where
    F: FnOnce() -> Result<(), AudioError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AudioError::Engine(format!("audio task failed: {}", e)))?
}
