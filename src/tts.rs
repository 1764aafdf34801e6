//! Text-to-speech playback
//!
//! Plays synthesized speech fetched elsewhere (the REST synthesis endpoint
//! streams a WAV file in arbitrary byte chunks) through the [`AudioHub`]
//! using the playback-only profile.

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use std::fmt::Display;

use crate::audio::format::SoundClip;
use crate::audio::hub::AudioHub;
use crate::audio::route::AudioProfile;
use crate::constants::WAV_HEADER_LEN;
use crate::error::AudioError;

/// Regroups a byte stream into clips the playback queue accepts: the first
/// clip carries a complete header, every payload holds whole samples.
#[derive(Debug, Default)]
struct ClipAssembler {
    pending: BytesMut,
    started: bool,
}

impl ClipAssembler {
    fn push(&mut self, chunk: &[u8]) -> Option<Bytes> {
        self.pending.extend_from_slice(chunk);
        if !self.started && self.pending.len() < WAV_HEADER_LEN {
            return None;
        }
        self.started = true;

        let probe = SoundClip::new("", None, self.pending.clone().freeze());
        let header_len = probe.raw.len() - probe.headerless_data().len();
        let payload = self.pending.len() - header_len;
        let ready = header_len + payload - payload % 2;
        if ready == 0 {
            return None;
        }
        Some(self.pending.split_to(ready).freeze())
    }

    /// Bytes that never formed a whole sample
    fn leftover(&self) -> usize {
        self.pending.len()
    }
}

/// Playback-only driver for the audio hub
pub struct TtsPlayer {
    hub: AudioHub,
}

impl TtsPlayer {
    pub fn new(hub: AudioHub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &AudioHub {
        &self.hub
    }

    /// Configure the playback profile and start audio
    pub async fn prepare(&self) -> Result<(), AudioError> {
        tracing::info!("Preparing TTS playback");
        self.hub.configure(AudioProfile::Playback).await?;
        self.hub.start().await
    }

    /// Enqueue every chunk of `stream` in arrival order. Returns the number
    /// of clips handed to the hub.
    pub async fn play_stream<S, E>(&self, stream: S) -> Result<usize, AudioError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let mut stream = Box::pin(stream);
        let mut assembler = ClipAssembler::default();
        let mut enqueued = 0usize;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AudioError::SoundPlayerDecoding(format!("speech stream failed: {}", e)))?;
            let Some(raw) = assembler.push(&chunk) else {
                continue;
            };

            let clip = SoundClip::new("tts", Some(enqueued as u32), raw);
            if enqueued == 0 && clip.header.is_none() {
                return Err(AudioError::HeaderMissing);
            }
            self.hub.enqueue(clip).await?;
            enqueued += 1;
        }

        if assembler.leftover() > 0 {
            tracing::debug!("Dropping {} trailing bytes of speech", assembler.leftover());
        }
        tracing::debug!("Speech stream finished after {} clips", enqueued);
        Ok(enqueued)
    }

    pub async fn teardown(&self) -> Result<(), AudioError> {
        tracing::info!("Tearing down TTS playback");
        self.hub.stop().await
    }
}
