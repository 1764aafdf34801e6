//! PCM formats, WAV headers and sound clips
//!
//! The wire format is always 16-bit little-endian linear PCM. Hardware
//! buffers arrive as 32-bit float and are converted at the graph edges.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::{Buf, Bytes};
use std::fmt;

use crate::constants::WAV_HEADER_LEN;
use crate::error::AudioError;

/// Describes a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// 16 for integer PCM, 32 for float
    pub bits_per_sample: u16,
    pub interleaved: bool,
}

impl AudioFormat {
    /// 16-bit integer PCM, interleaved when multi-channel
    pub fn pcm_i16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 16,
            interleaved: channels > 1,
        }
    }

    /// 32-bit float, interleaved (the layout hardware callbacks deliver)
    pub fn float32(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 32,
            interleaved: true,
        }
    }

    pub fn is_float(&self) -> bool {
        self.bits_per_sample == 32
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    /// Check the format describes a usable stream
    pub fn validate(&self) -> Result<(), AudioError> {
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(AudioError::OutputFormat(format!("degenerate format {}", self)));
        }
        if self.bits_per_sample != 16 && self.bits_per_sample != 32 {
            return Err(AudioError::OutputFormat(format!(
                "unsupported bit depth {}",
                self.bits_per_sample
            )));
        }
        Ok(())
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {}-bit {}",
            self.sample_rate,
            self.channels,
            self.bits_per_sample,
            if self.is_float() { "float" } else { "int" }
        )
    }
}

/// Canonical RIFF/WAVE header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavHeader {
    pub chunk_id: String,
    pub format: String,
    pub subchunk1_id: String,
    pub audio_format: u16,
    pub num_channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

impl WavHeader {
    /// Parse the leading 44 bytes; `None` when absent or not RIFF/WAVE
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < WAV_HEADER_LEN {
            return None;
        }
        let tag = |range: std::ops::Range<usize>| String::from_utf8_lossy(&data[range]).into_owned();

        let mut fields = &data[20..36];
        let header = WavHeader {
            chunk_id: tag(0..4),
            format: tag(8..12),
            subchunk1_id: tag(12..16),
            audio_format: fields.get_u16_le(),
            num_channels: fields.get_u16_le(),
            sample_rate: fields.get_u32_le(),
            byte_rate: fields.get_u32_le(),
            block_align: fields.get_u16_le(),
            bits_per_sample: fields.get_u16_le(),
        };

        if header.is_valid() {
            Some(header)
        } else {
            None
        }
    }

    pub fn is_valid(&self) -> bool {
        self.chunk_id == "RIFF" && self.format == "WAVE"
    }

    /// Playback format declared by the header
    pub fn audio_format(&self) -> Result<AudioFormat, AudioError> {
        if self.bits_per_sample != 16 {
            return Err(AudioError::OutputFormat(format!(
                "clip declares {}-bit samples, only 16-bit PCM is playable",
                self.bits_per_sample
            )));
        }
        let format = AudioFormat::pcm_i16(self.sample_rate, self.num_channels);
        format.validate()?;
        Ok(format)
    }
}

/// Offset of the PCM payload inside a WAV file.
///
/// Walks the chunk list so files carrying extra chunks (LIST, fact) still
/// strip correctly; falls back to the canonical 44 bytes.
fn wav_data_offset(data: &[u8]) -> usize {
    let mut offset = 12;
    while offset + 8 <= data.len() {
        let id = &data[offset..offset + 4];
        let mut size_bytes = &data[offset + 4..offset + 8];
        let size = size_bytes.get_u32_le() as usize;
        if id == b"data" {
            return offset + 8;
        }
        // chunks are word aligned
        offset = offset.saturating_add(8 + size + (size & 1));
    }
    WAV_HEADER_LEN.min(data.len())
}

/// One unit of synthesized speech
#[derive(Debug, Clone)]
pub struct SoundClip {
    pub id: String,
    /// Ordering hint from the server
    pub index: Option<u32>,
    pub raw: Bytes,
    pub header: Option<WavHeader>,
}

impl SoundClip {
    /// Wrap raw bytes, detecting a WAV header
    pub fn new(id: impl Into<String>, index: Option<u32>, raw: Bytes) -> Self {
        let header = WavHeader::parse(&raw);
        Self {
            id: id.into(),
            index,
            raw,
            header,
        }
    }

    /// Decode a base64 payload from the server
    pub fn from_base64(id: impl Into<String>, index: Option<u32>, data: &str) -> Result<Self, AudioError> {
        let raw = BASE64
            .decode(data)
            .map_err(|e| AudioError::SoundPlayerDecoding(e.to_string()))?;
        Ok(Self::new(id, index, Bytes::from(raw)))
    }

    /// Playback format from the header
    pub fn playback_format(&self) -> Result<AudioFormat, AudioError> {
        self.header
            .as_ref()
            .ok_or(AudioError::HeaderMissing)?
            .audio_format()
    }

    /// PCM payload with any header stripped
    pub fn headerless_data(&self) -> Bytes {
        match self.header {
            Some(_) => self.raw.slice(wav_data_offset(&self.raw)..),
            None => self.raw.clone(),
        }
    }
}

/// Interpret little-endian bytes as i16 samples (a trailing odd byte is ignored)
pub fn bytes_to_i16(data: &[u8], out: &mut [i16]) -> usize {
    let count = (data.len() / 2).min(out.len());
    for (i, pair) in data.chunks_exact(2).take(count).enumerate() {
        out[i] = i16::from_le_bytes([pair[0], pair[1]]);
    }
    count
}

/// Quantize a float sample in [-1, 1] to i16
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Floor used for silent or muted buffers
pub const MIN_POWER_DB: f32 = -160.0;

/// RMS power of i16 samples in dBFS
pub fn average_power_db(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return MIN_POWER_DB;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = i16_to_f32(s) as f64;
            v * v
        })
        .sum();
    let rms = (sum / samples.len() as f64).sqrt() as f32;
    to_db(rms)
}

/// Peak level of i16 samples in dBFS
pub fn peak_db(samples: &[i16]) -> f32 {
    let peak = samples
        .iter()
        .map(|&s| i16_to_f32(s).abs())
        .fold(0.0f32, f32::max);
    to_db(peak)
}

fn to_db(level: f32) -> f32 {
    if level > 0.0 {
        (20.0 * level.log10()).max(MIN_POWER_DB)
    } else {
        MIN_POWER_DB
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wav_bytes(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_parse_wav_header() {
        let data = wav_bytes(24000, 1, &[1, 2, 3, 4]);
        let header = WavHeader::parse(&data).unwrap();

        assert_eq!(header.chunk_id, "RIFF");
        assert_eq!(header.format, "WAVE");
        assert_eq!(header.subchunk1_id, "fmt ");
        assert_eq!(header.audio_format, 1);
        assert_eq!(header.num_channels, 1);
        assert_eq!(header.sample_rate, 24000);
        assert_eq!(header.byte_rate, 48000);
        assert_eq!(header.block_align, 2);
        assert_eq!(header.bits_per_sample, 16);
    }

    #[test]
    fn test_headerless_pcm_is_not_a_header() {
        let data = vec![7u8; 100];
        assert!(WavHeader::parse(&data).is_none());

        let clip = SoundClip::new("a", Some(0), Bytes::from(data.clone()));
        assert!(clip.header.is_none());
        assert_eq!(clip.headerless_data().as_ref(), &data[..]);
        assert_eq!(clip.playback_format(), Err(AudioError::HeaderMissing));
    }

    #[test]
    fn test_strip_header() {
        let samples = [100i16, -100, 200, -200];
        let clip = SoundClip::new("b", None, Bytes::from(wav_bytes(48000, 2, &samples)));

        let pcm = clip.headerless_data();
        assert_eq!(pcm.len(), samples.len() * 2);

        let mut decoded = [0i16; 4];
        assert_eq!(bytes_to_i16(&pcm, &mut decoded), 4);
        assert_eq!(decoded, samples);
        assert_eq!(clip.playback_format().unwrap(), AudioFormat::pcm_i16(48000, 2));
    }

    #[test]
    fn test_from_base64() {
        let wav = wav_bytes(48000, 1, &[0, 1, 2]);
        let clip = SoundClip::from_base64("c", Some(3), &BASE64.encode(&wav)).unwrap();
        assert_eq!(clip.index, Some(3));
        assert!(clip.header.is_some());

        let err = SoundClip::from_base64("d", None, "!!not base64!!").unwrap_err();
        assert!(matches!(err, AudioError::SoundPlayerDecoding(_)));
    }

    #[test]
    fn test_non_16_bit_header_rejected() {
        let mut data = wav_bytes(48000, 1, &[0, 0]);
        // bits_per_sample lives at offset 34
        data[34] = 24;
        let header = WavHeader::parse(&data).unwrap();
        assert!(matches!(header.audio_format(), Err(AudioError::OutputFormat(_))));
    }

    #[test]
    fn test_power_levels() {
        assert_eq!(average_power_db(&[0; 64]), MIN_POWER_DB);
        let full = vec![i16::MAX; 64];
        assert!(average_power_db(&full).abs() < 0.01);
        assert!(peak_db(&[0, 16384, -8000]) > -6.1);
        assert!(peak_db(&[0, 16384, -8000]) < -5.9);
    }

    #[test]
    fn test_quantize() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.5), i16::MAX);
        assert_eq!(f32_to_i16(-1.0), -i16::MAX);
    }
}
