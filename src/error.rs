//! Error types for the voice client
//!
//! Every layer has its own enum. Layer errors are `Clone` so they can be
//! published on the session event stream as well as returned to callers.

use thiserror::Error;

use crate::network::messages::WebSocketError;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sample-rate / format conversion errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResamplerError {
    #[error("Conversion failed: {0}")]
    ConversionFailed(String),
}

/// Microphone capture errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Resampler error: {0}")]
    Resampler(#[from] ResamplerError),

    #[error("Failed to spawn delivery thread: {0}")]
    DeliveryThread(String),
}

/// Platform audio session / routing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Audio session is unconfigured")]
    Unconfigured,

    #[error("No available input or output devices in the current session")]
    NoAvailableDevices,

    #[error("Invalid output configuration: multiple or no output routes found")]
    MultipleOutputRoutes,

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("Platform error: {0}")]
    Platform(String),
}

/// Audio hub errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Audio session configuration failed: {0}")]
    AudioSessionConfig(#[from] RouteError),

    #[error("Failed to decode sound clip: {0}")]
    SoundPlayerDecoding(String),

    #[error("Sound player could not be initialized")]
    SoundPlayerInitialization,

    #[error("Sound clip has no WAV header")]
    HeaderMissing,

    #[error("Audio hub is not running")]
    NotRunning,

    #[error("Unsupported output format: {0}")]
    OutputFormat(String),

    #[error("Audio engine error: {0}")]
    Engine(String),

    #[error("Microphone error: {0}")]
    Microphone(#[from] CaptureError),
}

/// Duplex message channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The connection never reached the server
    #[error("Connection error: {0}")]
    Connection(String),

    /// I/O failure on an established connection
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Unknown message type: {0}")]
    UnknownMessage(String),

    /// The remote went away
    #[error("Disconnected")]
    Disconnected,

    /// Normal closure
    #[error("Closed")]
    Closed,
}

impl ChannelError {
    /// Whether the error means the server ended the connection
    pub fn is_closure(&self) -> bool {
        matches!(self, ChannelError::Closed | ChannelError::Disconnected)
    }

    /// Whether the error concerns a single frame and leaves the connection usable
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            ChannelError::Encoding(_) | ChannelError::Decoding(_) | ChannelError::UnknownMessage(_)
        )
    }
}

/// Session-level errors surfaced by the connection controller
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Socket is not connected")]
    SocketDisconnected,

    #[error("Microphone initialization failed: {0}")]
    MicrophoneInitialization(AudioError),

    #[error("Failed to send over socket: {0}")]
    SocketSend(ChannelError),

    #[error("Server error {}: {}", .0.code, .0.message)]
    WebSocket(WebSocketError),

    #[error("Audio hub failed to start: {0}")]
    AudioHubStartFailure(AudioError),

    #[error("Audio hub failed to stop: {0}")]
    AudioHubStopFailure(AudioError),

    #[error("Audio hub configuration failed: {0}")]
    AudioHubConfigurationFailure(AudioError),

    #[error("Audio hub error: {0}")]
    AudioHub(AudioError),

    #[error("Socket connection failed: {0}")]
    SocketConnectionFailure(ChannelError),

    #[error("Invalid session settings: {0}")]
    InvalidSessionSettings(String),

    #[error("Connect cancelled by disconnect")]
    Cancelled,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
