// Wire codec for PCM audio
//
// Captured and played audio crosses the wire as base64 text of
// little-endian 16-bit PCM. Both directions are pure functions.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::VoiceError;

/// Convert samples to little-endian PCM bytes
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Convert little-endian PCM bytes to samples
///
/// Fails on an odd byte count, which cannot be 16-bit PCM.
pub fn bytes_to_samples(bytes: &[u8]) -> Result<Vec<i16>, VoiceError> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encode samples into the wire representation (base64 PCM16LE)
pub fn encode(samples: &[i16]) -> String {
    BASE64.encode(samples_to_bytes(samples))
}

/// Decode a wire string back into samples
pub fn decode(wire: &str) -> Result<Vec<i16>, VoiceError> {
    let bytes = decode_bytes(wire)?;
    bytes_to_samples(&bytes)
}

/// Encode raw PCM bytes without reinterpreting them
pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_bytes(wire: &str) -> Result<Vec<u8>, VoiceError> {
    Ok(BASE64.decode(wire.trim())?)
}

/// Playback duration of `sample_count` interleaved samples
pub fn duration_ms(sample_count: usize, sample_rate: u32, channels: u16) -> u64 {
    if sample_rate == 0 || channels == 0 {
        return 0;
    }
    (sample_count as u64 * 1000) / (sample_rate as u64 * channels as u64)
}
