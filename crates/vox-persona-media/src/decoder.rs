//! Decodes base64 PCM16 payloads into float sample buffers.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use vox_persona_core::error::{Result, VoxError};

/// A decoded, playable buffer. Samples are de-interleaved into one plane per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub planes: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn from_mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            planes: vec![samples],
        }
    }

    /// Sample frames per channel.
    pub fn frames(&self) -> usize {
        self.planes.first().map_or(0, Vec::len)
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Channel average, used when rendering to the playback timeline.
    pub fn mono(&self) -> Arc<[f32]> {
        if self.planes.len() == 1 {
            return Arc::from(self.planes[0].as_slice());
        }
        let scale = 1.0 / self.planes.len() as f32;
        (0..self.frames())
            .map(|i| self.planes.iter().map(|p| p[i]).sum::<f32>() * scale)
            .collect()
    }
}

/// Decode a base64 payload of raw signed 16-bit little-endian PCM.
///
/// All-or-nothing: any malformed input yields [`VoxError::Decode`] and no buffer.
pub fn decode_audio(payload: &str, sample_rate: u32, channels: u16) -> Result<AudioBuffer> {
    if sample_rate == 0 {
        return Err(VoxError::Decode("sample rate must be positive".into()));
    }
    if channels == 0 {
        return Err(VoxError::Decode("channel count must be positive".into()));
    }

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| VoxError::Decode(format!("invalid base64: {e}")))?;

    let frame_width = 2 * usize::from(channels);
    if bytes.len() % frame_width != 0 {
        return Err(VoxError::Decode(format!(
            "payload of {} bytes is not a multiple of {frame_width}-byte frames",
            bytes.len()
        )));
    }

    let frames = bytes.len() / frame_width;
    let mut planes = vec![Vec::with_capacity(frames); usize::from(channels)];
    for (i, chunk) in bytes.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        planes[i % usize::from(channels)].push(f32::from(sample) / 32768.0);
    }

    Ok(AudioBuffer {
        sample_rate,
        channels,
        planes,
    })
}

/// Extract the `rate=` parameter from a type tag such as `audio/pcm;rate=24000`.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}
