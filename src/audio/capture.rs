//! Microphone capture
//!
//! The engine's input callback feeds [`CaptureEngine::input_sink`]. Each buffer
//! is resampled to the wire format on the audio thread, then handed over a
//! bounded channel to a dedicated delivery thread that invokes the registered
//! handler, so consumer work never blocks the real-time callback.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::engine::InputSink;
use crate::audio::format::{average_power_db, AudioFormat, MIN_POWER_DB};
use crate::audio::resampler::Resampler;
use crate::error::CaptureError;

/// Warn on the first dropped chunk, then once per this many
const DROP_LOG_EVERY: u64 = 50;

/// One wire-format microphone chunk
#[derive(Debug, Clone, PartialEq)]
pub struct MicrophoneChunk {
    /// Mono 16-bit little-endian PCM
    pub data: Bytes,
    /// RMS power in dBFS
    pub average_power: f32,
    /// Capture order, starting at 0
    pub sequence: u64,
}

/// Consumer of microphone chunks, invoked on the delivery thread in capture order
pub type MicrophoneHandler = Arc<dyn Fn(MicrophoneChunk) + Send + Sync>;

/// Owns the microphone tap, the resampler and the delivery thread
pub struct CaptureEngine {
    source_format: AudioFormat,
    wire_format: AudioFormat,
    frames_per_chunk: usize,

    resampler: Arc<Mutex<Resampler>>,
    muted: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handler: Arc<RwLock<Option<MicrophoneHandler>>>,

    chunk_tx: Sender<MicrophoneChunk>,
    sequence: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,

    thread_handle: Option<JoinHandle<()>>,
}

impl CaptureEngine {
    /// Create a capture engine converting `source_format` hardware buffers into
    /// `frames_per_chunk`-frame chunks of `wire_format`.
    pub fn new(
        source_format: AudioFormat,
        wire_format: AudioFormat,
        frames_per_chunk: usize,
        queue_depth: usize,
    ) -> Result<Self, CaptureError> {
        let resampler = Resampler::new(source_format, wire_format, frames_per_chunk)?;

        let (chunk_tx, chunk_rx) = bounded::<MicrophoneChunk>(queue_depth.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let handler: Arc<RwLock<Option<MicrophoneHandler>>> = Arc::new(RwLock::new(None));

        let thread_handle = {
            let running = running.clone();
            let handler = handler.clone();
            thread::Builder::new()
                .name("mic-delivery".to_string())
                .spawn(move || deliver_chunks(chunk_rx, running, handler))
                .map_err(|e| CaptureError::DeliveryThread(e.to_string()))?
        };

        tracing::info!(
            "Microphone capture configured: {} -> {} ({} frames per chunk)",
            source_format,
            wire_format,
            frames_per_chunk
        );

        Ok(Self {
            source_format,
            wire_format,
            frames_per_chunk,
            resampler: Arc::new(Mutex::new(resampler)),
            muted: Arc::new(AtomicBool::new(false)),
            running,
            handler,
            chunk_tx,
            sequence: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            thread_handle: Some(thread_handle),
        })
    }

    /// Callback to install on the engine's input node
    pub fn input_sink(&self) -> InputSink {
        let resampler = self.resampler.clone();
        let muted = self.muted.clone();
        let chunk_tx = self.chunk_tx.clone();
        let sequence = self.sequence.clone();
        let dropped = self.dropped.clone();

        Arc::new(move |samples: &[f32]| {
            let mut resampler = resampler.lock();
            let result = resampler.resample(samples, |pcm| {
                let is_muted = muted.load(Ordering::Relaxed);
                let (data, average_power) = if is_muted {
                    (Bytes::from(vec![0u8; pcm.len() * 2]), MIN_POWER_DB)
                } else {
                    let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
                    (Bytes::from(bytes), average_power_db(pcm))
                };

                let chunk = MicrophoneChunk {
                    data,
                    average_power,
                    sequence: sequence.fetch_add(1, Ordering::Relaxed),
                };
                if let Err(TrySendError::Full(chunk)) = chunk_tx.try_send(chunk) {
                    let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if total == 1 || total % DROP_LOG_EVERY == 0 {
                        tracing::warn!(
                            "Microphone delivery queue full, dropped chunk {} ({} dropped so far)",
                            chunk.sequence,
                            total
                        );
                    }
                }
            });

            if let Err(e) = result {
                tracing::error!("Resampling failed: {}", e);
            }
        })
    }

    /// Register the chunk consumer, or clear it with `None`
    pub fn set_handler(&self, handler: Option<MicrophoneHandler>) {
        *self.handler.write() = handler;
    }

    pub fn has_handler(&self) -> bool {
        self.handler.read().is_some()
    }

    /// Replace outgoing audio with silence of the same size
    pub fn set_muted(&self, muted: bool) {
        let was = self.muted.swap(muted, Ordering::SeqCst);
        if was != muted {
            tracing::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Drop partially accumulated input, e.g. after the input device changed
    pub fn reset(&self) {
        self.resampler.lock().reset();
    }

    pub fn source_format(&self) -> AudioFormat {
        self.source_format
    }

    pub fn wire_format(&self) -> AudioFormat {
        self.wire_format
    }

    pub fn frames_per_chunk(&self) -> usize {
        self.frames_per_chunk
    }

    /// Chunks produced so far
    pub fn chunks_captured(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Chunks dropped because the delivery queue was full
    pub fn chunks_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deliver_chunks(
    chunk_rx: Receiver<MicrophoneChunk>,
    running: Arc<AtomicBool>,
    handler: Arc<RwLock<Option<MicrophoneHandler>>>,
) {
    while running.load(Ordering::Relaxed) {
        match chunk_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(chunk) => {
                // clone out so the handler runs without holding the lock
                let current = handler.read().clone();
                match current {
                    Some(handler) => handler(chunk),
                    None => tracing::trace!("No microphone handler set, dropping chunk {}", chunk.sequence),
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("Microphone delivery thread exiting");
}
