//! Application configuration
//!
//! Loaded from `<config dir>/evi-chat/config.toml`. Every field has a
//! default, so a missing file or a partial one is valid. Credentials may also
//! come from `HUME_API_KEY` / `HUME_ACCESS_TOKEN`, which win over the file.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::audio::hub::HubSettings;
use crate::audio::playback::PlaybackSettings;
use crate::constants::{
    CAPTURE_QUEUE_DEPTH, CROSSFADE_SAMPLES, DEFAULT_HOST, DEFAULT_SAMPLE_RATE, FADE_IN_SAMPLES, FRAME_DURATION_MS,
};
use crate::error::{Error, Result};
use crate::network::auth::Credentials;
use crate::network::channel::SessionParams;
use crate::network::messages::SessionSettings;

pub const API_KEY_ENV: &str = "HUME_API_KEY";
pub const ACCESS_TOKEN_ENV: &str = "HUME_ACCESS_TOKEN";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            api_key: None,
            access_token: None,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Microphone wire rate
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub fade_in_samples: usize,
    pub crossfade_enabled: bool,
    pub crossfade_samples: usize,
    pub output_metering: bool,
    pub capture_queue_depth: usize,
    pub device_poll_interval_ms: u64,
    /// Input device by name; system default when unset
    pub input_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_duration_ms: FRAME_DURATION_MS,
            fade_in_samples: FADE_IN_SAMPLES,
            crossfade_enabled: false,
            crossfade_samples: CROSSFADE_SAMPLES,
            output_metering: false,
            capture_queue_depth: CAPTURE_QUEUE_DEPTH,
            device_poll_interval_ms: 1000,
            input_device: None,
        }
    }
}

impl AudioConfig {
    pub fn frames_per_chunk(&self) -> usize {
        (self.sample_rate as u64 * self.frame_duration_ms as u64 / 1000) as usize
    }

    pub fn playback_settings(&self) -> PlaybackSettings {
        PlaybackSettings {
            fade_in_samples: self.fade_in_samples,
            crossfade_enabled: self.crossfade_enabled,
            crossfade_samples: self.crossfade_samples,
        }
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            sample_rate: self.sample_rate,
            frames_per_chunk: self.frames_per_chunk(),
            capture_queue_depth: self.capture_queue_depth,
            playback: self.playback_settings(),
            output_metering: self.output_metering,
        }
    }

    pub fn device_poll_interval(&self) -> Duration {
        Duration::from_millis(self.device_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub config_id: Option<String>,
    pub config_version: Option<u32>,
    pub resumed_chat_group_id: Option<String>,
    pub system_prompt: Option<String>,
    /// Echoed on every server message; a fresh id per run when unset
    pub custom_session_id: Option<String>,
}

impl AppConfig {
    /// `<config dir>/evi-chat/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "evi-chat").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read `path`, apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&text)?;
        tracing::info!("Loaded config from {}", path.display());
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when no file exists
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                tracing::debug!("No config file, using defaults");
                let mut config = Self::default();
                config.apply_env(|name| std::env::var(name).ok());
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV).filter(|v| !v.is_empty()) {
            self.api.api_key = Some(key);
        }
        if let Some(token) = lookup(ACCESS_TOKEN_ENV).filter(|v| !v.is_empty()) {
            self.api.access_token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.host.trim().is_empty() {
            return Err(Error::Config("api.host must not be empty".to_string()));
        }
        if self.audio.sample_rate == 0 {
            return Err(Error::Config("audio.sample_rate must be positive".to_string()));
        }
        if self.audio.frame_duration_ms == 0 {
            return Err(Error::Config("audio.frame_duration_ms must be positive".to_string()));
        }
        if self.audio.frames_per_chunk() == 0 {
            return Err(Error::Config(format!(
                "{} ms at {} Hz is shorter than one frame",
                self.audio.frame_duration_ms, self.audio.sample_rate
            )));
        }
        if self.audio.capture_queue_depth == 0 {
            return Err(Error::Config("audio.capture_queue_depth must be positive".to_string()));
        }
        Ok(())
    }

    /// An access token is preferred over an API key
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.api.access_token, &self.api.api_key) {
            (Some(token), _) => Some(Credentials::access_token(token.clone())),
            (None, Some(key)) => Some(Credentials::api_key(key.clone())),
            (None, None) => None,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.api.connect_timeout_secs)
    }

    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            config_id: self.session.config_id.clone(),
            config_version: self.session.config_version,
            resumed_chat_group_id: self.session.resumed_chat_group_id.clone(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        let mut settings = match &self.session.system_prompt {
            Some(prompt) => SessionSettings::default().with_system_prompt(prompt.clone()),
            None => SessionSettings::default(),
        };
        settings.custom_session_id = Some(
            self.session
                .custom_session_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        );
        settings
    }
}
