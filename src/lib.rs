//! # EVI Voice Client
//!
//! Real-time duplex voice conversation client. It captures the microphone, streams
//! it to a speech service over a WebSocket, and plays synthesized speech back
//! without gaps.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        ConnectionController (session)                     │
//! │   disconnected → connecting → connected → disconnecting → disconnected    │
//! │                                                                            │
//! │   ┌───────────────────────────────┐        ┌──────────────────────────┐   │
//! │   │            AudioHub            │        │   MessageChannel (ws)     │   │
//! │   │  unconfigured → ... → running  │        │  session_settings first   │   │
//! │   │                                │        │  then audio_input ...     │   │
//! │   │ ┌───────────┐  ┌────────────┐  │ chunks │                           │   │
//! │   │ │ Capture   │─▶│ Resampler  │──┼───────▶│──────────▶ network        │   │
//! │   │ │ Engine    │  │ f32 → i16  │  │        │                           │   │
//! │   │ └───────────┘  └────────────┘  │        │                           │   │
//! │   │ ┌──────────────────────────┐   │ clips  │                           │   │
//! │   │ │ PlaybackQueue            │◀──┼────────│◀────────── network        │   │
//! │   │ │ fade-in / crossfade      │   │        │                           │   │
//! │   │ └──────────────────────────┘   │        └──────────────────────────┘   │
//! │   │ ┌──────────────────────────┐   │                                       │
//! │   │ │ AudioRouteManager        │   │  route / configuration changes        │
//! │   │ └──────────────────────────┘   │                                       │
//! │   └───────────────────────────────┘                                       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Real-time audio callbacks never touch the network: capture hands chunks to a
//! delivery thread, and the render path only pulls from the playback queue.

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod session;
pub mod state;
pub mod tts;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default wire sample rate for microphone audio
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Microphone audio is sent mono
    pub const INPUT_CHANNELS: u16 = 1;

    /// Duration of one microphone chunk in milliseconds
    pub const FRAME_DURATION_MS: u32 = 20;

    /// Frames per microphone chunk at the default rate
    pub const FRAMES_PER_CHUNK: usize = (DEFAULT_SAMPLE_RATE * FRAME_DURATION_MS / 1000) as usize;

    /// Fade-in window applied when playback resumes from silence
    pub const FADE_IN_SAMPLES: usize = 1024;

    /// Overlap window when crossfading adjacent clips
    pub const CROSSFADE_SAMPLES: usize = 1024;

    /// Canonical RIFF/WAVE header size
    pub const WAV_HEADER_LEN: usize = 44;

    /// Frames per output render block when driving the playback queue
    pub const RENDER_BLOCK_FRAMES: usize = 480;

    /// How often the hub polls the engine for stream failures
    pub const ENGINE_HEALTH_INTERVAL_MS: u64 = 250;

    /// Default depth of the capture hand-off queue (in chunks)
    pub const CAPTURE_QUEUE_DEPTH: usize = 64;

    /// Server error slug for an idle session that was closed
    pub const INACTIVITY_TIMEOUT_SLUG: &str = "inactivity_timeout";

    /// Default API host
    pub const DEFAULT_HOST: &str = "api.hume.ai";

    /// WebSocket path of the chat endpoint
    pub const CHAT_PATH: &str = "/v0/evi/chat";

    /// Audio encoding declared in session settings
    pub const WIRE_ENCODING: &str = "linear16";
}
