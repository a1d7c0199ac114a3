//! Sample framer: float capture blocks to base64 PCM16 frames.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// One outbound unit of audio, ready for transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Base64-encoded PCM16 little-endian samples.
    pub data: String,
    pub mime_type: String,
}

/// MIME-style type tag for raw 16-bit PCM at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Convert one normalized sample to PCM16.
///
/// Clamps to [-1, 1], scales by 32767 and rounds half away from zero.
/// NaN encodes as silence.
pub fn float_to_pcm16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Encode a captured block as a little-endian PCM16 frame.
pub fn encode_block(samples: &[f32], sample_rate: u32) -> Frame {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&float_to_pcm16(s).to_le_bytes());
    }
    Frame {
        data: STANDARD.encode(&bytes),
        mime_type: pcm_mime_type(sample_rate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_audio;

    fn raw(frame: &Frame) -> Vec<i16> {
        STANDARD
            .decode(&frame.data)
            .unwrap()
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_boundary_values() {
        assert_eq!(float_to_pcm16(-1.0), -32767);
        assert_eq!(float_to_pcm16(0.0), 0);
        assert_eq!(float_to_pcm16(1.0), 32767);
    }

    #[test]
    fn test_half_rounds_away_from_zero() {
        // 0.5 * 32767 = 16383.5 exactly
        assert_eq!(float_to_pcm16(0.5), 16384);
        assert_eq!(float_to_pcm16(-0.5), -16384);
    }

    #[test]
    fn test_out_of_range_clamped() {
        assert_eq!(float_to_pcm16(1.7), 32767);
        assert_eq!(float_to_pcm16(-3.0), -32767);
        assert_eq!(float_to_pcm16(f32::NAN), 0);
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_block(&[0.0, 1.0, -1.0], 16_000);
        assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
        let bytes = STANDARD.decode(&frame.data).unwrap();
        assert_eq!(bytes, vec![0x00, 0x00, 0xFF, 0x7F, 0x01, 0x80]);
        assert_eq!(raw(&frame), vec![0, 32767, -32767]);
    }

    #[test]
    fn test_round_trip_within_quantization_step() {
        let block: Vec<f32> = (0..1024)
            .map(|i| ((i as f32) * 0.037).sin() * 0.93)
            .chain([1.0, -1.0, 0.0, 0.5, -0.5])
            .collect();
        let frame = encode_block(&block, 16_000);
        let decoded = decode_audio(&frame.data, 16_000, 1).unwrap();

        // Encoding scales by 32767 while decoding divides by 32768, so the
        // worst case is half a step of rounding plus the scale mismatch.
        let tolerance = 1.5 / 32768.0 + f32::EPSILON;
        for (orig, back) in block.iter().zip(decoded.planes[0].iter()) {
            assert!((orig - back).abs() <= tolerance, "{orig} -> {back}");
        }
        assert_eq!(decoded.frames(), block.len());
    }
}
