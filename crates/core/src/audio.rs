//! Audio Codec Adapter
//!
//! Converts between the base64 PCM16 text carried in wire messages and raw
//! sample buffers. Sample rate and channel count travel with every frame;
//! they are never inferred from the payload.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sample rates used by the supported backends.
pub const NOVA_SONIC_PCM16_SAMPLE_RATE: u32 = 16000;
pub const GEMINI_LIVE_INPUT_SAMPLE_RATE: u32 = 16000;
pub const GEMINI_LIVE_OUTPUT_SAMPLE_RATE: u32 = 24000;
pub const OPENAI_REALTIME_PCM16_SAMPLE_RATE: u32 = 24000;

/// The only wire format the relay accepts.
pub const PCM_FORMAT: &str = "pcm";
/// Frames are always mono.
pub const MONO: u16 = 1;

/// Errors raised while decoding a client audio payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64 audio payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("PCM16 payload has odd byte length {0}")]
    OddByteLength(usize),
    #[error("unsupported audio format '{0}', expected 'pcm'")]
    UnsupportedFormat(String),
    #[error("unsupported channel count {0}, expected mono")]
    UnsupportedChannels(u16),
}

/// A buffer of 16-bit signed samples at a declared rate and channel count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: MONO,
        }
    }

    /// Playback length of the frame.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() as u64 / self.channels as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }

    /// Little-endian PCM16 bytes for this frame.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples
            .iter()
            .flat_map(|&sample| sample.to_le_bytes())
            .collect()
    }
}

/// Per-backend audio parameters, fixed at session bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub channels: u16,
    pub voice: String,
}

impl AudioConfig {
    pub fn mono(input_sample_rate: u32, output_sample_rate: u32, voice: impl Into<String>) -> Self {
        Self {
            input_sample_rate,
            output_sample_rate,
            channels: MONO,
            voice: voice.into(),
        }
    }

    /// Checks a client-declared capture rate against what the backend expects.
    pub fn check_input_rate(&self, declared: Option<u32>) -> Result<(), crate::RelayError> {
        match declared {
            Some(rate) if rate != self.input_sample_rate => {
                Err(crate::RelayError::Configuration(format!(
                    "declared input sample rate {} Hz does not match backend rate {} Hz",
                    rate, self.input_sample_rate
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Decodes base64 PCM16 text into a frame with the given rate and channels.
pub fn decode(base64_text: &str, sample_rate: u32, channels: u16) -> Result<AudioFrame, DecodeError> {
    if channels != MONO {
        return Err(DecodeError::UnsupportedChannels(channels));
    }
    let bytes = base64::engine::general_purpose::STANDARD.decode(base64_text)?;
    let samples = decode_pcm16(&bytes)?;
    Ok(AudioFrame {
        samples,
        sample_rate,
        channels,
    })
}

/// Decodes a wire payload, also validating its declared format.
pub fn decode_wire(
    base64_text: &str,
    format: &str,
    sample_rate: u32,
    channels: u16,
) -> Result<AudioFrame, DecodeError> {
    if !format.eq_ignore_ascii_case(PCM_FORMAT) {
        return Err(DecodeError::UnsupportedFormat(format.to_string()));
    }
    decode(base64_text, sample_rate, channels)
}

/// Encodes a frame's samples as base64 PCM16 text.
pub fn encode(frame: &AudioFrame) -> String {
    encode_i16(&frame.samples)
}

/// Interprets little-endian bytes as PCM16 samples.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<i16>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddByteLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

pub fn encode_i16(pcm16: &[i16]) -> String {
    let pcm16_bytes: Vec<u8> = pcm16
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&pcm16_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_decode_known_samples() {
        // 256 = [0x00, 0x01], -256 = [0x00, 0xFF]
        let frame = decode(&b64(&[0x00, 0x01, 0x00, 0xFF]), 16000, 1).unwrap();
        assert_eq!(frame.samples, vec![256, -256]);
        assert_eq!(frame.sample_rate, 16000);
        assert_eq!(frame.channels, 1);
    }

    #[test]
    fn test_round_trip_preserves_frame() {
        let frame = AudioFrame::new(vec![1000, -2000, 0, i16::MAX, i16::MIN], 24000);
        let decoded = decode(&encode(&frame), frame.sample_rate, frame.channels).unwrap();
        assert_eq!(decoded, frame);

        let empty = AudioFrame::new(vec![], 16000);
        assert_eq!(decode(&encode(&empty), 16000, 1).unwrap(), empty);
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        for input in ["invalid_base64!", "@@@@", "abc"] {
            let err = decode(input, 16000, 1).unwrap_err();
            assert!(matches!(err, DecodeError::InvalidBase64(_)), "{input}: {err}");
        }
    }

    #[test]
    fn test_decode_rejects_odd_byte_length() {
        let err = decode(&b64(&[0x00, 0x01, 0x02]), 16000, 1).unwrap_err();
        assert!(matches!(err, DecodeError::OddByteLength(3)));
    }

    #[test]
    fn test_decode_wire_validates_format_and_channels() {
        let payload = b64(&[0x00, 0x01]);
        assert!(decode_wire(&payload, "pcm", 16000, 1).is_ok());
        assert!(matches!(
            decode_wire(&payload, "opus", 16000, 1),
            Err(DecodeError::UnsupportedFormat(f)) if f == "opus"
        ));
        assert!(matches!(
            decode_wire(&payload, "pcm", 16000, 2),
            Err(DecodeError::UnsupportedChannels(2))
        ));
    }

    #[test]
    fn test_duration() {
        let frame = AudioFrame::new(vec![0; 1600], 16000);
        assert_eq!(frame.duration(), Duration::from_millis(100));
        assert_eq!(AudioFrame::new(vec![0; 10], 0).duration(), Duration::ZERO);
    }

    #[test]
    fn test_check_input_rate() {
        let config = AudioConfig::mono(16000, 24000, "Puck");
        assert!(config.check_input_rate(None).is_ok());
        assert!(config.check_input_rate(Some(16000)).is_ok());
        let err = config.check_input_rate(Some(48000)).unwrap_err();
        assert!(matches!(err, crate::RelayError::Configuration(_)));
    }

    #[test]
    fn test_sample_rate_constants() {
        assert_eq!(NOVA_SONIC_PCM16_SAMPLE_RATE, 16000);
        assert_eq!(GEMINI_LIVE_INPUT_SAMPLE_RATE, 16000);
        assert_eq!(GEMINI_LIVE_OUTPUT_SAMPLE_RATE, 24000);
        assert_eq!(OPENAI_REALTIME_PCM16_SAMPLE_RATE, 24000);
    }
}
