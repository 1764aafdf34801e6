//! Platform audio session and route management
//!
//! [`AudioRouteManager`] applies one [`AudioProfile`] to the platform session,
//! picks the best input/output pair whenever the route changes, and forwards
//! configuration changes so the hub can rebuild its graph. The platform itself
//! sits behind the [`AudioPlatform`] trait and is injected, never global.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::constants::{DEFAULT_SAMPLE_RATE, FRAME_DURATION_MS};
use crate::error::RouteError;

/// Named session profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioProfile {
    /// Full duplex conversation: microphone plus playback
    VoiceChat,
    /// Playback only, used for text-to-speech
    Playback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCategory {
    PlayAndRecord,
    Playback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    VideoChat,
    MoviePlayback,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryOptions {
    pub allow_bluetooth: bool,
    pub allow_bluetooth_a2dp: bool,
    pub allow_airplay: bool,
    pub default_to_speaker: bool,
    pub override_muted_microphone_interruption: bool,
}

impl AudioProfile {
    pub fn category(&self) -> SessionCategory {
        match self {
            AudioProfile::VoiceChat => SessionCategory::PlayAndRecord,
            AudioProfile::Playback => SessionCategory::Playback,
        }
    }

    pub fn mode(&self) -> SessionMode {
        match self {
            AudioProfile::VoiceChat => SessionMode::VideoChat,
            AudioProfile::Playback => SessionMode::MoviePlayback,
        }
    }

    pub fn options(&self) -> CategoryOptions {
        match self {
            AudioProfile::VoiceChat => CategoryOptions {
                allow_bluetooth: true,
                allow_bluetooth_a2dp: true,
                allow_airplay: true,
                default_to_speaker: true,
                override_muted_microphone_interruption: true,
            },
            AudioProfile::Playback => CategoryOptions::default(),
        }
    }

    pub fn requires_microphone(&self) -> bool {
        matches!(self, AudioProfile::VoiceChat)
    }

    /// Hardware buffer duration requested from the platform
    pub fn preferred_io_buffer_duration(&self) -> Option<Duration> {
        match self {
            AudioProfile::VoiceChat => Some(Duration::from_millis(FRAME_DURATION_MS as u64)),
            AudioProfile::Playback => None,
        }
    }

    pub fn preferred_sample_rate(&self) -> Option<u32> {
        match self {
            AudioProfile::VoiceChat => Some(DEFAULT_SAMPLE_RATE),
            AudioProfile::Playback => None,
        }
    }
}

impl fmt::Display for AudioProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioProfile::VoiceChat => write!(f, "voice-chat"),
            AudioProfile::Playback => write!(f, "playback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortType {
    BuiltInMic,
    BuiltInReceiver,
    BuiltInSpeaker,
    Headphones,
    HeadsetMic,
    Bluetooth,
    Usb,
    LineIn,
    LineOut,
    Hdmi,
    Other,
}

impl PortType {
    pub fn is_built_in_output(&self) -> bool {
        matches!(self, PortType::BuiltInReceiver | PortType::BuiltInSpeaker)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPort {
    pub name: String,
    pub port_type: PortType,
}

impl AudioPort {
    pub fn new(name: impl Into<String>, port_type: PortType) -> Self {
        Self {
            name: name.into(),
            port_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputOverride {
    None,
    Speaker,
}

/// Why the platform route changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChangeReason {
    Unknown,
    NewDeviceAvailable,
    OldDeviceUnavailable,
    CategoryChange,
    Override,
    WakeFromSleep,
    NoSuitableRouteForCategory,
    RouteConfigurationChange,
}

impl RouteChangeReason {
    /// Whether the best-fit route has to be recomputed. The others are
    /// side effects of our own category or override changes.
    pub fn requires_rerouting(&self) -> bool {
        matches!(
            self,
            RouteChangeReason::NewDeviceAvailable
                | RouteChangeReason::OldDeviceUnavailable
                | RouteChangeReason::Unknown
                | RouteChangeReason::WakeFromSleep
                | RouteChangeReason::RouteConfigurationChange
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionKind {
    Began,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrophoneModeKind {
    Standard,
    WideSpectrum,
    VoiceIsolation,
}

impl MicrophoneModeKind {
    pub fn title(&self) -> &'static str {
        match self {
            MicrophoneModeKind::Standard => "Standard",
            MicrophoneModeKind::WideSpectrum => "Wide Spectrum",
            MicrophoneModeKind::VoiceIsolation => "Voice Isolation",
        }
    }
}

/// Snapshot of the hardware voice-isolation setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicrophoneMode {
    /// Mode the user selected
    pub preferred: MicrophoneModeKind,
    /// Mode currently in effect
    pub active: MicrophoneModeKind,
}

impl Default for MicrophoneMode {
    fn default() -> Self {
        Self {
            preferred: MicrophoneModeKind::Standard,
            active: MicrophoneModeKind::Standard,
        }
    }
}

/// Notifications raised by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformNotification {
    RouteChange(RouteChangeReason),
    /// The hardware graph changed underneath the engine (device lost, rate change)
    ConfigurationChange,
    Interruption(InterruptionKind),
}

pub type NotificationHandler = Arc<dyn Fn(PlatformNotification) + Send + Sync>;

/// Platform audio session
pub trait AudioPlatform: Send + Sync {
    fn available_categories(&self) -> Vec<SessionCategory>;

    fn set_category(
        &self,
        category: SessionCategory,
        mode: SessionMode,
        options: CategoryOptions,
    ) -> Result<(), RouteError>;

    fn set_preferred_sample_rate(&self, sample_rate: u32) -> Result<(), RouteError>;

    fn set_preferred_io_buffer_duration(&self, duration: Duration) -> Result<(), RouteError>;

    fn set_active(&self, active: bool) -> Result<(), RouteError>;

    fn available_inputs(&self) -> Vec<AudioPort>;

    fn current_outputs(&self) -> Vec<AudioPort>;

    fn set_preferred_input(&self, port: &AudioPort) -> Result<(), RouteError>;

    fn override_output(&self, port: OutputOverride) -> Result<(), RouteError>;

    fn microphone_mode(&self) -> MicrophoneMode;

    /// Install the receiver for platform notifications. Called once.
    fn observe(&self, handler: NotificationHandler);
}

/// Published by the route manager
#[derive(Debug, Clone, PartialEq)]
pub enum RouteEvent {
    RouteChanged {
        reason: RouteChangeReason,
        input: String,
        output: String,
        speaker_active: bool,
    },
    RouteChangeSkipped(RouteChangeReason),
    RoutingFailed(RouteError),
    ConfigurationChanged,
    Interruption(InterruptionKind),
}

/// Selected input/output pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSelection {
    pub input: AudioPort,
    pub output: AudioPort,
}

/// Pick the input that best matches the single current output: same port
/// type first, then anything that is not the built-in mic, then the first.
pub fn best_fit(inputs: &[AudioPort], outputs: &[AudioPort]) -> Result<RouteSelection, RouteError> {
    if inputs.is_empty() {
        return Err(RouteError::NoAvailableDevices);
    }
    let output = match outputs {
        [output] => output,
        _ => return Err(RouteError::MultipleOutputRoutes),
    };

    let input = inputs
        .iter()
        .find(|i| i.port_type == output.port_type)
        .or_else(|| inputs.iter().find(|i| i.port_type != PortType::BuiltInMic))
        .unwrap_or(&inputs[0]);

    Ok(RouteSelection {
        input: input.clone(),
        output: output.clone(),
    })
}

struct RouteState {
    profile: Option<AudioProfile>,
    last_input: Option<AudioPort>,
    observing: bool,
}

struct RouteInner {
    platform: Arc<dyn AudioPlatform>,
    state: Mutex<RouteState>,
    speaker_active: AtomicBool,
    events: broadcast::Sender<RouteEvent>,
}

/// Owns the platform audio session configuration
#[derive(Clone)]
pub struct AudioRouteManager {
    inner: Arc<RouteInner>,
}

impl AudioRouteManager {
    pub fn new(platform: Arc<dyn AudioPlatform>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(RouteInner {
                platform,
                state: Mutex::new(RouteState {
                    profile: None,
                    last_input: None,
                    observing: false,
                }),
                speaker_active: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn platform(&self) -> &Arc<dyn AudioPlatform> {
        &self.inner.platform
    }

    /// Apply the category, mode and options for `profile`. Reapplying the
    /// active profile is a no-op.
    pub fn configure(&self, profile: AudioProfile) -> Result<(), RouteError> {
        tracing::info!("Configuring audio session with {}", profile);
        if self.profile() == Some(profile) {
            tracing::warn!("Audio session already configured for {}", profile);
            return Ok(());
        }

        let platform = &self.inner.platform;
        let apply = || -> Result<(), RouteError> {
            if let Some(duration) = profile.preferred_io_buffer_duration() {
                platform.set_preferred_io_buffer_duration(duration)?;
            }
            if let Some(rate) = profile.preferred_sample_rate() {
                platform.set_preferred_sample_rate(rate)?;
            }
            let category = profile.category();
            if !platform.available_categories().contains(&category) {
                return Err(RouteError::UnsupportedConfiguration(format!(
                    "{:?} is not supported",
                    category
                )));
            }
            platform.set_category(category, profile.mode(), profile.options())
        };

        apply().map_err(|e| match e {
            RouteError::UnsupportedConfiguration(_) => e,
            other => {
                tracing::error!("Failed to configure audio session: {}", other);
                RouteError::UnsupportedConfiguration("Failed to configure audio session".to_string())
            }
        })?;

        self.inner.state.lock().profile = Some(profile);
        self.register_observers();
        tracing::info!("Audio session configured successfully");
        Ok(())
    }

    /// Activate the session and route it
    pub fn start(&self) -> Result<(), RouteError> {
        if self.profile().is_none() {
            return Err(RouteError::Unconfigured);
        }
        self.inner.platform.set_active(true)?;
        self.handle_routing()?;
        Ok(())
    }

    pub fn stop(&self) -> Result<(), RouteError> {
        self.inner.platform.set_active(false)
    }

    pub fn profile(&self) -> Option<AudioProfile> {
        self.inner.state.lock().profile
    }

    pub fn last_input(&self) -> Option<AudioPort> {
        self.inner.state.lock().last_input.clone()
    }

    /// Whether output is currently forced to the built-in speaker
    pub fn is_speaker_active(&self) -> bool {
        self.inner.speaker_active.load(Ordering::SeqCst)
    }

    pub fn microphone_mode(&self) -> MicrophoneMode {
        self.inner.platform.microphone_mode()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouteEvent> {
        self.inner.events.subscribe()
    }

    /// Dispatch a platform notification
    pub fn handle_notification(&self, notification: PlatformNotification) {
        match notification {
            PlatformNotification::RouteChange(reason) => self.handle_route_change(reason),
            PlatformNotification::ConfigurationChange => self.handle_configuration_change(),
            PlatformNotification::Interruption(kind) => self.handle_interruption(kind),
        }
    }

    pub fn handle_route_change(&self, reason: RouteChangeReason) {
        tracing::info!("Route change notification received: {:?}", reason);
        if !reason.requires_rerouting() {
            tracing::info!("Skipping route change, handled as interruption: {:?}", reason);
            self.publish(RouteEvent::RouteChangeSkipped(reason));
            return;
        }
        if self.profile().is_none() {
            tracing::debug!("Ignoring route change while unconfigured");
            return;
        }

        match self.handle_routing() {
            Ok(selection) => self.publish(RouteEvent::RouteChanged {
                reason,
                input: selection.input.name,
                output: selection.output.name,
                speaker_active: self.is_speaker_active(),
            }),
            Err(e) => {
                tracing::error!("Route change error: {}", e);
                self.publish(RouteEvent::RoutingFailed(e));
            }
        }
    }

    pub fn handle_configuration_change(&self) {
        tracing::info!("Audio configuration changed");
        self.publish(RouteEvent::ConfigurationChanged);
    }

    pub fn handle_interruption(&self, kind: InterruptionKind) {
        tracing::info!("Interruption notification received: {:?}", kind);
        self.publish(RouteEvent::Interruption(kind));
    }

    fn handle_routing(&self) -> Result<RouteSelection, RouteError> {
        let platform = &self.inner.platform;
        let selection = best_fit(&platform.available_inputs(), &platform.current_outputs())?;

        tracing::info!(
            "Routing audio: input '{}', output '{}'",
            selection.input.name,
            selection.output.name
        );

        let previous = self.inner.state.lock().last_input.clone();
        if let Some(previous) = previous {
            if previous.name != selection.input.name {
                tracing::debug!(
                    "Input changed from '{}' to '{}'",
                    previous.name,
                    selection.input.name
                );
                platform.set_preferred_input(&selection.input)?;
            }
        }
        self.inner.state.lock().last_input = Some(selection.input.clone());

        let default_to_speaker = self
            .profile()
            .map(|p| p.options().default_to_speaker)
            .unwrap_or(false);
        if selection.output.port_type.is_built_in_output() && default_to_speaker {
            tracing::info!("Overriding to speaker output");
            platform.override_output(OutputOverride::Speaker)?;
            self.inner.speaker_active.store(true, Ordering::SeqCst);
        } else {
            tracing::info!("Setting output override to none");
            platform.override_output(OutputOverride::None)?;
            self.inner.speaker_active.store(false, Ordering::SeqCst);
        }

        Ok(selection)
    }

    fn register_observers(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.observing {
                return;
            }
            state.observing = true;
        }
        let weak: Weak<RouteInner> = Arc::downgrade(&self.inner);
        self.inner.platform.observe(Arc::new(move |notification| {
            if let Some(inner) = weak.upgrade() {
                AudioRouteManager { inner }.handle_notification(notification);
            }
        }));
    }

    fn publish(&self, event: RouteEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }
}
