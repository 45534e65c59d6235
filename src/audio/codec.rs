//! Linear PCM frame codec
//!
//! Converts captured float samples into the compact wire representation
//! (signed 16-bit, little-endian) and back. Quantization is lossy but
//! monotonic: the only shaping applied is a hard clip followed by a fixed gain.

use crate::config::AudioConfig;
use bytes::{BufMut, Bytes, BytesMut};

/// Width of one encoded sample in bytes
pub const SAMPLE_WIDTH: usize = 2;

const ENCODE_SCALE: f32 = 32767.0;
const DECODE_SCALE: f32 = 32768.0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Zero-length or otherwise unusable payload
    #[error("invalid audio frame: {0}")]
    InvalidFrame(&'static str),
}

/// Symmetric PCM codec with a configurable clip ceiling and gain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameCodec {
    clip_ceiling: f32,
    gain: f32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self { clip_ceiling: 0.9, gain: 1.1 }
    }
}

impl FrameCodec {
    pub fn new(clip_ceiling: f32, gain: f32) -> Self {
        Self { clip_ceiling, gain }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(config.clip_ceiling, config.gain)
    }

    pub fn clip_ceiling(&self) -> f32 {
        self.clip_ceiling
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    #[inline]
    fn quantize(&self, sample: f32) -> i16 {
        // NaN clamps to NaN and `as` maps it to 0
        let shaped = sample.clamp(-self.clip_ceiling, self.clip_ceiling) * self.gain;
        (shaped * ENCODE_SCALE).floor().clamp(i16::MIN as f32, i16::MAX as f32) as i16
    }

    /// Encode samples into little-endian 16-bit PCM bytes.
    pub fn encode(&self, samples: &[f32]) -> Bytes {
        let mut out = BytesMut::with_capacity(samples.len() * SAMPLE_WIDTH);
        for &sample in samples {
            out.put_i16_le(self.quantize(sample));
        }
        out.freeze()
    }

    /// Encode samples into the integer form carried by JSON `audio` messages.
    pub fn encode_pcm(&self, samples: &[f32]) -> Vec<i16> {
        samples.iter().map(|&s| self.quantize(s)).collect()
    }

    /// Decode little-endian 16-bit PCM bytes.
    ///
    /// A trailing partial sample is truncated.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::InvalidFrame("empty payload"));
        }
        let samples: Vec<f32> = bytes
            .chunks_exact(SAMPLE_WIDTH)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / DECODE_SCALE)
            .collect();
        if samples.is_empty() {
            return Err(CodecError::InvalidFrame("payload shorter than one sample"));
        }
        Ok(samples)
    }

    /// Decode the integer form carried by JSON `audio` messages.
    pub fn decode_pcm(&self, pcm: &[i16]) -> Result<Vec<f32>, CodecError> {
        if pcm.is_empty() {
            return Err(CodecError::InvalidFrame("empty payload"));
        }
        Ok(pcm.iter().map(|&s| s as f32 / DECODE_SCALE).collect())
    }
}

/// Mean absolute amplitude of a frame.
pub fn frame_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
}
