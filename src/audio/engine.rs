//! Signal graph boundary and the cpal implementation
//!
//! The hub talks to hardware only through [`AudioEngine`]: an input tap that
//! receives interleaved float buffers, and an output source that is pulled for
//! 16-bit blocks in the clip format. [`CpalEngine`] runs both streams on a
//! dedicated thread and converts rate and channel layout for the device.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use rubato::{FftFixedIn, Resampler as _};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::{find_input_device, DeviceSelection};
use crate::audio::format::{i16_to_f32, AudioFormat};
use crate::constants::RENDER_BLOCK_FRAMES;
use crate::error::AudioError;

/// Receives interleaved float microphone buffers on the audio thread
pub type InputSink = Arc<dyn Fn(&[f32]) + Send + Sync>;

/// Fills interleaved i16 blocks in the connected output format on the audio thread
pub type RenderSource = Arc<dyn Fn(&mut [i16]) + Send + Sync>;

/// Hardware signal graph
pub trait AudioEngine: Send + Sync {
    /// Native capture format (always float)
    fn input_format(&self) -> Result<AudioFormat, AudioError>;

    /// Native output format (always float)
    fn output_format(&self) -> Result<AudioFormat, AudioError>;

    /// Echo cancellation / voice processing on the duplex path
    fn enable_voice_processing(&self) -> Result<(), AudioError>;

    fn connect_input(&self, sink: InputSink);

    fn disconnect_input(&self);

    /// Attach a render source producing `format` blocks; replaces any previous source
    fn connect_output(&self, format: AudioFormat, source: RenderSource) -> Result<(), AudioError>;

    fn disconnect_output(&self);

    fn start(&self) -> Result<(), AudioError>;

    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Next stream failure reported since the last call
    fn take_error(&self) -> Option<AudioError> {
        None
    }
}

struct OutputSlot {
    format: AudioFormat,
    source: RenderSource,
    generation: u64,
}

/// Desktop engine backed by cpal
pub struct CpalEngine {
    selection: DeviceSelection,
    input: Arc<RwLock<Option<InputSink>>>,
    output: Arc<RwLock<Option<OutputSlot>>>,
    generation: AtomicU64,
    running: Arc<AtomicBool>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    error_rx: Mutex<Option<Receiver<AudioError>>>,
}

impl CpalEngine {
    /// `selection` names the preferred input device, shared with the platform
    pub fn new(selection: DeviceSelection) -> Self {
        Self {
            selection,
            input: Arc::new(RwLock::new(None)),
            output: Arc::new(RwLock::new(None)),
            generation: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: Mutex::new(None),
            error_rx: Mutex::new(None),
        }
    }

    fn input_device(&self) -> Option<cpal::Device> {
        let preferred = self.selection.read().clone();
        find_input_device(preferred.as_deref())
    }
}

impl AudioEngine for CpalEngine {
    fn input_format(&self) -> Result<AudioFormat, AudioError> {
        let device = self
            .input_device()
            .ok_or_else(|| AudioError::Engine("No input device available".to_string()))?;
        let config = device
            .default_input_config()
            .map_err(|e| AudioError::Engine(e.to_string()))?;
        Ok(AudioFormat::float32(config.sample_rate().0, config.channels()))
    }

    fn output_format(&self) -> Result<AudioFormat, AudioError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| AudioError::Engine("No output device available".to_string()))?;
        let config = device
            .default_output_config()
            .map_err(|e| AudioError::Engine(e.to_string()))?;
        Ok(AudioFormat::float32(config.sample_rate().0, config.channels()))
    }

    fn enable_voice_processing(&self) -> Result<(), AudioError> {
        Err(AudioError::Engine(
            "voice processing is not available on this host".to_string(),
        ))
    }

    fn connect_input(&self, sink: InputSink) {
        *self.input.write() = Some(sink);
    }

    fn disconnect_input(&self) {
        *self.input.write() = None;
    }

    fn connect_output(&self, format: AudioFormat, source: RenderSource) -> Result<(), AudioError> {
        if format.bits_per_sample != 16 {
            return Err(AudioError::OutputFormat(format!(
                "render source must produce 16-bit samples, got {}",
                format
            )));
        }
        format.validate()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.output.write() = Some(OutputSlot {
            format,
            source,
            generation,
        });
        tracing::debug!("Output connected: {}", format);
        Ok(())
    }

    fn disconnect_output(&self) {
        *self.output.write() = None;
    }

    fn start(&self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        *self.error_rx.lock() = Some(error_rx);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let input_device = self.input_device();
        let input = self.input.clone();
        let output = self.output.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-engine".to_string())
            .spawn(move || {
                let streams = build_streams(input_device, input, output, error_tx);
                let streams = match streams {
                    Ok(streams) => streams,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                for stream in &streams {
                    if let Err(e) = stream.play() {
                        tracing::error!("Failed to start stream: {}", e);
                        let _ = ready_tx.send(Err(AudioError::Engine(e.to_string())));
                        return;
                    }
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Streams are dropped here, stopping the hardware
            })
            .map_err(|e| AudioError::Engine(e.to_string()))?;

        *self.thread_handle.lock() = Some(handle);

        let result = ready_rx
            .recv_timeout(Duration::from_secs(3))
            .unwrap_or_else(|_| Err(AudioError::Engine("audio thread did not start".to_string())));

        if result.is_err() {
            self.stop();
        } else {
            tracing::info!("Audio engine started");
        }
        result
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
            tracing::info!("Audio engine stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn take_error(&self) -> Option<AudioError> {
        self.error_rx.lock().as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for CpalEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_streams(
    input_device: Option<cpal::Device>,
    input: Arc<RwLock<Option<InputSink>>>,
    output: Arc<RwLock<Option<OutputSlot>>>,
    error_tx: Sender<AudioError>,
) -> Result<Vec<cpal::Stream>, AudioError> {
    let mut streams = Vec::with_capacity(2);

    if input.read().is_some() {
        let device = input_device
            .ok_or_else(|| AudioError::Engine("No input device available".to_string()))?;
        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::Engine(e.to_string()))?;
        let config: StreamConfig = supported.config();
        let err_tx = error_tx.clone();
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_input::<f32>(&device, &config, input, err_tx),
            SampleFormat::I16 => build_input::<i16>(&device, &config, input, err_tx),
            SampleFormat::U16 => build_input::<u16>(&device, &config, input, err_tx),
            other => Err(AudioError::Engine(format!("unsupported input sample format {:?}", other))),
        }?;
        tracing::info!(
            "Input stream: {} Hz, {} ch, {:?}",
            config.sample_rate.0,
            config.channels,
            supported.sample_format()
        );
        streams.push(stream);
    }

    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::Engine("No output device available".to_string()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::Engine(e.to_string()))?;
    let config: StreamConfig = supported.config();
    let renderer = OutputRenderer::new(config.sample_rate.0, config.channels);
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&device, &config, output, renderer, error_tx),
        SampleFormat::I16 => build_output::<i16>(&device, &config, output, renderer, error_tx),
        SampleFormat::U16 => build_output::<u16>(&device, &config, output, renderer, error_tx),
        other => Err(AudioError::Engine(format!("unsupported output sample format {:?}", other))),
    }?;
    streams.push(stream);

    Ok(streams)
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    input: Arc<RwLock<Option<InputSink>>>,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let sink = input.read().clone();
                let Some(sink) = sink else {
                    return;
                };
                scratch.clear();
                scratch.extend(data.iter().map(|s| s.to_sample::<f32>()));
                sink(&scratch);
            },
            move |err| {
                let _ = error_tx.try_send(AudioError::Engine(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::Engine(e.to_string()))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    output: Arc<RwLock<Option<OutputSlot>>>,
    mut renderer: OutputRenderer,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                {
                    let slot = output.read();
                    renderer.fill(&mut scratch, slot.as_ref().map(|s| (s.generation, s.format, &s.source)));
                }
                for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
                    *dst = T::from_sample(src);
                }
            },
            move |err| {
                let _ = error_tx.try_send(AudioError::Engine(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::Engine(e.to_string()))
}

/// Adapts a clip-format render source to the device rate and channel layout
pub(crate) struct OutputRenderer {
    device_rate: u32,
    device_channels: usize,
    generation: u64,
    source_format: Option<AudioFormat>,
    resampler: Option<FftFixedIn<f32>>,
    block: Vec<i16>,
    planar: Vec<Vec<f32>>,
    resampled: Vec<Vec<f32>>,
    fifo: VecDeque<f32>,
}

impl OutputRenderer {
    pub(crate) fn new(device_rate: u32, device_channels: u16) -> Self {
        Self {
            device_rate,
            device_channels: device_channels.max(1) as usize,
            generation: 0,
            source_format: None,
            resampler: None,
            block: Vec::new(),
            planar: Vec::new(),
            resampled: Vec::new(),
            fifo: VecDeque::new(),
        }
    }

    /// Fill interleaved device samples from the connected source, or silence
    pub(crate) fn fill(&mut self, out: &mut [f32], source: Option<(u64, AudioFormat, &RenderSource)>) {
        let Some((generation, format, render)) = source else {
            out.fill(0.0);
            self.fifo.clear();
            return;
        };
        if generation != self.generation || self.source_format.is_none() {
            self.rebuild(generation, format);
        }

        while self.fifo.len() < out.len() {
            if !self.render_block(render) {
                break;
            }
        }

        for sample in out.iter_mut() {
            *sample = self.fifo.pop_front().unwrap_or(0.0);
        }
    }

    fn rebuild(&mut self, generation: u64, format: AudioFormat) {
        let channels = format.channels.max(1) as usize;
        self.generation = generation;
        self.source_format = Some(format);
        self.fifo.clear();

        self.resampler = if format.sample_rate == self.device_rate {
            None
        } else {
            match FftFixedIn::<f32>::new(
                format.sample_rate as usize,
                self.device_rate as usize,
                RENDER_BLOCK_FRAMES,
                2,
                channels,
            ) {
                Ok(resampler) => Some(resampler),
                Err(e) => {
                    tracing::error!("Output resampler unavailable: {}", e);
                    None
                }
            }
        };

        let out_frames = self
            .resampler
            .as_ref()
            .map(|r| r.output_frames_max())
            .unwrap_or(RENDER_BLOCK_FRAMES);
        self.block = vec![0; RENDER_BLOCK_FRAMES * channels];
        self.planar = vec![vec![0.0; RENDER_BLOCK_FRAMES]; channels];
        self.resampled = vec![vec![0.0; out_frames]; channels];
        self.fifo.reserve(out_frames * self.device_channels * 2);
    }

    /// Pull one block from the source into the fifo
    fn render_block(&mut self, render: &RenderSource) -> bool {
        let Some(format) = self.source_format else {
            return false;
        };
        let channels = format.channels.max(1) as usize;

        render(&mut self.block);
        for (frame_idx, frame) in self.block.chunks_exact(channels).enumerate() {
            for (ch, &s) in frame.iter().enumerate() {
                self.planar[ch][frame_idx] = i16_to_f32(s);
            }
        }

        let frames = match self.resampler.as_mut() {
            Some(resampler) => {
                match resampler.process_into_buffer(&self.planar, &mut self.resampled, None) {
                    Ok((_, written)) => written,
                    Err(e) => {
                        tracing::error!("Output resampling failed: {}", e);
                        return false;
                    }
                }
            }
            None => {
                for (dst, src) in self.resampled.iter_mut().zip(&self.planar) {
                    dst[..src.len()].copy_from_slice(src);
                }
                RENDER_BLOCK_FRAMES
            }
        };

        let device_channels = self.device_channels;
        for i in 0..frames {
            for d in 0..device_channels {
                let value = if channels == device_channels {
                    self.resampled[d][i]
                } else if device_channels == 1 {
                    self.resampled.iter().map(|c| c[i]).sum::<f32>() / channels as f32
                } else {
                    self.resampled[d % channels][i]
                };
                self.fifo.push_back(value);
            }
        }
        true
    }
}
