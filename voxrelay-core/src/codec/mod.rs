//! Sample codec: float PCM <-> 16-bit little-endian PCM <-> base64 text.
//!
//! Browsers and cpal hand us `f32` samples in [-1.0, 1.0]. The live voice
//! service speaks 16-bit signed little-endian PCM wrapped in base64 with a
//! MIME tag such as `audio/pcm;rate=16000`. Everything here is pure.
//!
//! Out-of-range input saturates at the `i16` bounds instead of wrapping.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VoxError};

/// Scale between `f32` in [-1, 1] and `i16` PCM.
pub const PCM16_SCALE: f32 = 32768.0;

/// Bytes per 16-bit sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Build the MIME tag for 16-bit PCM at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// A base64 PCM payload tagged with its MIME type.
///
/// Serialises as `{"mimeType": "...", "data": "..."}`, the shape the live
/// voice protocol uses for both realtime input and inline model audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedChunk {
    mime_type: String,
    data: String,
}

impl EncodedChunk {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Base64 text of the PCM bytes.
    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the MIME tag describes audio.
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    /// The `rate=` parameter of the MIME tag, if present.
    pub fn sample_rate(&self) -> Option<u32> {
        self.mime_type
            .split(';')
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|rate| rate.trim().parse().ok())
    }
}

/// A decoded block of audio ready for output, one `Vec` per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl PlaybackBuffer {
    /// Frames per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }
}

/// Convert float samples to 16-bit little-endian PCM bytes.
///
/// Each sample is scaled by 32768 and truncated toward zero; `as` saturates,
/// so 1.0 becomes 32767 and NaN becomes 0.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        let value = (sample * PCM16_SCALE) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Convert 16-bit little-endian PCM bytes to float samples.
///
/// A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM16_SCALE)
        .collect()
}

/// Encode one captured frame for the wire.
pub fn encode_outbound(samples: &[f32], sample_rate: u32) -> EncodedChunk {
    EncodedChunk {
        mime_type: pcm_mime_type(sample_rate),
        data: STANDARD.encode(f32_to_pcm16(samples)),
    }
}

/// Decode base64 text to raw PCM bytes.
pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| VoxError::Payload(e.to_string()))
}

/// Decode an inbound base64 PCM payload to float samples.
///
/// # Errors
/// `VoxError::Payload` if `data` is not valid base64.
pub fn decode_inbound(data: &str) -> Result<Vec<f32>> {
    Ok(pcm16_to_f32(&decode_base64(data)?))
}

/// Build a playback buffer from interleaved 16-bit PCM bytes.
///
/// Frame count is `bytes.len() / 2 / channel_count`; leftover samples that do
/// not fill a whole frame are dropped. A channel count of 0 is treated as mono.
pub fn build_playback_buffer(bytes: &[u8], sample_rate: u32, channel_count: u16) -> PlaybackBuffer {
    let channel_count = usize::from(channel_count.max(1));
    let samples = pcm16_to_f32(bytes);
    let frames = bytes.len() / BYTES_PER_SAMPLE / channel_count;

    let channels = if channel_count == 1 {
        let mut mono = samples;
        mono.truncate(frames);
        vec![mono]
    } else {
        (0..channel_count)
            .map(|k| {
                samples
                    .iter()
                    .skip(k)
                    .step_by(channel_count)
                    .take(frames)
                    .copied()
                    .collect()
            })
            .collect()
    };

    PlaybackBuffer {
        sample_rate,
        channels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn round_trip_stays_within_quantization_step() {
        let samples: Vec<f32> = (-100..=100).map(|i| i as f32 / 100.0).collect();
        let chunk = encode_outbound(&samples, 16_000);
        let decoded = decode_inbound(chunk.data()).expect("valid base64");

        assert_eq!(decoded.len(), samples.len());
        for (original, back) in samples.iter().zip(&decoded) {
            assert_abs_diff_eq!(*original, *back, epsilon = 1.0 / PCM16_SCALE + 1e-7);
        }
    }

    #[test]
    fn out_of_range_samples_saturate_instead_of_wrapping() {
        let bytes = f32_to_pcm16(&[1.0, 1.5, -1.0, -3.0, f32::NAN]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(values, vec![i16::MAX, i16::MAX, i16::MIN, i16::MIN, 0]);
    }

    #[test]
    fn pcm_is_little_endian() {
        // 0.5 * 32768 = 16384 = 0x4000
        assert_eq!(f32_to_pcm16(&[0.5]), vec![0x00, 0x40]);
        assert_eq!(pcm16_to_f32(&[0x00, 0xC0]), vec![-0.5]);
    }

    #[test]
    fn truncated_bytes_yield_truncated_samples() {
        let samples = pcm16_to_f32(&[0x00, 0x40, 0x00]);
        assert_eq!(samples, vec![0.5]);
    }

    #[test]
    fn outbound_chunk_carries_pcm_mime_tag() {
        let chunk = encode_outbound(&[0.0; 4], 16_000);
        assert_eq!(chunk.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(chunk.sample_rate(), Some(16_000));
        assert!(chunk.is_audio());
        // 4 samples * 2 bytes = 8 bytes -> 12 base64 chars
        assert_eq!(chunk.data(), "AAAAAAAAAAA=");
    }

    #[test]
    fn invalid_base64_is_a_payload_error() {
        let err = decode_inbound("not base64!!").unwrap_err();
        assert!(matches!(err, VoxError::Payload(_)));
    }

    #[test]
    fn mono_buffer_copies_samples() {
        let bytes = f32_to_pcm16(&[0.25, -0.25, 0.5]);
        let buffer = build_playback_buffer(&bytes, 24_000, 1);
        assert_eq!(buffer.channel_count(), 1);
        assert_eq!(buffer.frames(), 3);
        assert_eq!(buffer.channels[0], vec![0.25, -0.25, 0.5]);
        assert_abs_diff_eq!(buffer.duration_secs(), 3.0 / 24_000.0);
    }

    #[test]
    fn stereo_buffer_deinterleaves_by_channel_index() {
        // L0 R0 L1 R1 L2 R2
        let interleaved = [0.1, -0.1, 0.2, -0.2, 0.3, -0.3];
        let bytes = f32_to_pcm16(&interleaved);
        let buffer = build_playback_buffer(&bytes, 24_000, 2);

        assert_eq!(buffer.frames(), bytes.len() / 2 / 2);
        let decoded = pcm16_to_f32(&bytes);
        for k in 0..2 {
            let expected: Vec<f32> = decoded.iter().skip(k).step_by(2).copied().collect();
            assert_eq!(buffer.channels[k], expected);
        }
    }

    #[test]
    fn partial_trailing_frame_is_dropped() {
        // 5 samples across 2 channels -> 2 whole frames
        let bytes = f32_to_pcm16(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        let buffer = build_playback_buffer(&bytes, 24_000, 2);
        assert_eq!(buffer.frames(), 2);
        assert_eq!(buffer.channels[0].len(), 2);
        assert_eq!(buffer.channels[1].len(), 2);
    }

    #[test]
    fn zero_channels_is_treated_as_mono() {
        let bytes = f32_to_pcm16(&[0.1, 0.2]);
        let buffer = build_playback_buffer(&bytes, 24_000, 0);
        assert_eq!(buffer.channel_count(), 1);
        assert_eq!(buffer.frames(), 2);
    }

    #[test]
    fn mime_without_rate_has_no_sample_rate() {
        let chunk = EncodedChunk::new("audio/pcm", "");
        assert_eq!(chunk.sample_rate(), None);
        assert!(chunk.is_empty());
    }
}
