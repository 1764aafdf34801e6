//! Audio subsystem module

pub mod capture;
pub mod device;
pub mod engine;
pub mod format;
pub mod hub;
pub mod playback;
pub mod resampler;
pub mod route;

pub use capture::{CaptureEngine, MicrophoneChunk, MicrophoneHandler};
pub use device::{list_devices, AudioDeviceInfo, CpalPlatform, DeviceWatcher};
pub use engine::{AudioEngine, CpalEngine};
pub use format::{AudioFormat, SoundClip, WavHeader};
pub use hub::{AudioHub, AudioHubState, HubEvent, HubSettings};
pub use playback::{PlaybackQueue, PlaybackSettings, RenderOutcome};
pub use resampler::Resampler;
pub use route::{AudioPlatform, AudioProfile, AudioRouteManager, MicrophoneMode, RouteEvent};
