//! Sample-rate and format conversion for microphone capture
//!
//! Converts interleaved float hardware buffers into fixed-size mono i16 chunks
//! at the wire rate. Buffers are reused between calls so the capture callback
//! does not allocate once it has warmed up.

use rubato::{FftFixedOut, Resampler as _};

use crate::audio::format::{f32_to_i16, AudioFormat};
use crate::error::ResamplerError;

/// Sub-chunk count handed to the FFT resampler; trades latency for CPU
const FFT_SUB_CHUNKS: usize = 2;

/// Fixed-output resampler from a hardware format to the wire format
pub struct Resampler {
    source: AudioFormat,
    destination: AudioFormat,
    frames_per_chunk: usize,
    /// `None` when source and destination rates match
    engine: Option<FftFixedOut<f32>>,
    /// Mono source-rate samples waiting for a full chunk
    pending: Vec<f32>,
    input_scratch: Vec<Vec<f32>>,
    output_scratch: Vec<Vec<f32>>,
    chunk: Vec<i16>,
}

impl Resampler {
    /// Create a resampler producing `frames_per_chunk` destination frames per chunk.
    ///
    /// The destination must be mono 16-bit PCM; any channel count is accepted on
    /// the source side and downmixed.
    pub fn new(
        source: AudioFormat,
        destination: AudioFormat,
        frames_per_chunk: usize,
    ) -> Result<Self, ResamplerError> {
        if source.sample_rate == 0 || source.channels == 0 {
            return Err(ResamplerError::ConversionFailed(format!(
                "unusable source format {}",
                source
            )));
        }
        if destination.sample_rate == 0 {
            return Err(ResamplerError::ConversionFailed(
                "destination sample rate is zero".to_string(),
            ));
        }
        if destination.channels != 1 {
            return Err(ResamplerError::ConversionFailed(format!(
                "unsupported destination channel layout: {} channels",
                destination.channels
            )));
        }
        if destination.bits_per_sample != 16 {
            return Err(ResamplerError::ConversionFailed(format!(
                "unsupported destination bit depth: {}",
                destination.bits_per_sample
            )));
        }
        if frames_per_chunk == 0 {
            return Err(ResamplerError::ConversionFailed(
                "chunk size must be non-zero".to_string(),
            ));
        }

        let engine = if source.sample_rate == destination.sample_rate {
            None
        } else {
            let engine = FftFixedOut::<f32>::new(
                source.sample_rate as usize,
                destination.sample_rate as usize,
                frames_per_chunk,
                FFT_SUB_CHUNKS,
                1,
            )
            .map_err(|e| ResamplerError::ConversionFailed(e.to_string()))?;
            Some(engine)
        };

        let input_capacity = engine
            .as_ref()
            .map(|e| e.input_frames_max())
            .unwrap_or(frames_per_chunk);

        tracing::debug!(
            "Resampler initialized: {} -> {}, {} frames per chunk",
            source,
            destination,
            frames_per_chunk
        );

        Ok(Self {
            source,
            destination,
            frames_per_chunk,
            engine,
            pending: Vec::with_capacity(input_capacity * 4),
            input_scratch: vec![Vec::with_capacity(input_capacity)],
            output_scratch: vec![vec![0.0; frames_per_chunk]],
            chunk: vec![0; frames_per_chunk],
        })
    }

    pub fn source_format(&self) -> AudioFormat {
        self.source
    }

    pub fn destination_format(&self) -> AudioFormat {
        self.destination
    }

    pub fn frames_per_chunk(&self) -> usize {
        self.frames_per_chunk
    }

    /// Feed interleaved source samples and emit every completed chunk.
    ///
    /// Returns the number of chunks emitted, which may be zero while input
    /// accumulates.
    pub fn resample(
        &mut self,
        interleaved: &[f32],
        mut emit: impl FnMut(&[i16]),
    ) -> Result<usize, ResamplerError> {
        self.downmix(interleaved);

        let mut emitted = 0;
        loop {
            let needed = match &self.engine {
                Some(engine) => engine.input_frames_next(),
                None => self.frames_per_chunk,
            };
            if self.pending.len() < needed {
                break;
            }

            match self.engine.as_mut() {
                Some(engine) => {
                    let input = &mut self.input_scratch[0];
                    input.clear();
                    input.extend_from_slice(&self.pending[..needed]);

                    let (_, written) = engine
                        .process_into_buffer(&self.input_scratch, &mut self.output_scratch, None)
                        .map_err(|e| ResamplerError::ConversionFailed(e.to_string()))?;

                    for (dst, &src) in self.chunk.iter_mut().zip(&self.output_scratch[0][..written]) {
                        *dst = f32_to_i16(src);
                    }
                }
                None => {
                    for (dst, &src) in self.chunk.iter_mut().zip(&self.pending[..needed]) {
                        *dst = f32_to_i16(src);
                    }
                }
            }

            self.pending.drain(..needed);
            emit(&self.chunk);
            emitted += 1;
        }

        Ok(emitted)
    }

    /// Drop buffered input
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(engine) = self.engine.as_mut() {
            engine.reset();
        }
    }

    fn downmix(&mut self, interleaved: &[f32]) {
        let channels = self.source.channels as usize;
        if channels == 1 {
            self.pending.extend_from_slice(interleaved);
            return;
        }
        let scale = 1.0 / channels as f32;
        self.pending.extend(
            interleaved
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() * scale),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(rate: u32) -> AudioFormat {
        AudioFormat::pcm_i16(rate, 1)
    }

    #[test]
    fn test_passthrough_chunks() {
        let mut resampler = Resampler::new(AudioFormat::float32(48000, 1), wire(48000), 960).unwrap();
        let input = vec![0.25f32; 960 * 2 + 100];

        let mut chunks = Vec::new();
        let emitted = resampler.resample(&input, |c| chunks.push(c.to_vec())).unwrap();

        assert_eq!(emitted, 2);
        assert!(chunks.iter().all(|c| c.len() == 960));
        assert_eq!(chunks[0][0], f32_to_i16(0.25));

        // the remaining 100 frames complete a chunk with 860 more
        let emitted = resampler.resample(&vec![0.0; 860], |_| {}).unwrap();
        assert_eq!(emitted, 1);
    }

    #[test]
    fn test_stereo_downmix() {
        let mut resampler = Resampler::new(AudioFormat::float32(48000, 2), wire(48000), 4).unwrap();
        let input = [0.5f32, -0.5, 0.5, 0.5, 1.0, 0.0, -1.0, -1.0];

        let mut out = Vec::new();
        resampler.resample(&input, |c| out.extend_from_slice(c)).unwrap();

        assert_eq!(out, vec![0, f32_to_i16(0.5), f32_to_i16(0.5), f32_to_i16(-1.0)]);
    }

    #[test]
    fn test_rate_conversion_produces_fixed_chunks() {
        let mut resampler = Resampler::new(AudioFormat::float32(44100, 1), wire(48000), 960).unwrap();

        let one_second: Vec<f32> = (0..44100)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / 44100.0).sin() * 0.5)
            .collect();

        let mut sizes = Vec::new();
        for block in one_second.chunks(512) {
            resampler.resample(block, |c| sizes.push(c.len())).unwrap();
        }

        // 48000 output frames per second, minus what the filter delay holds back
        assert!(sizes.len() >= 45 && sizes.len() <= 50, "got {} chunks", sizes.len());
        assert!(sizes.iter().all(|&s| s == 960));
    }

    #[test]
    fn test_incompatible_formats_rejected() {
        let stereo_out = AudioFormat::pcm_i16(48000, 2);
        assert!(matches!(
            Resampler::new(AudioFormat::float32(48000, 1), stereo_out, 960),
            Err(ResamplerError::ConversionFailed(_))
        ));

        let float_out = AudioFormat::float32(48000, 1);
        assert!(Resampler::new(AudioFormat::float32(48000, 1), float_out, 960).is_err());

        assert!(Resampler::new(AudioFormat::float32(0, 1), wire(48000), 960).is_err());
        assert!(Resampler::new(AudioFormat::float32(48000, 1), wire(48000), 0).is_err());
    }
}
