//! Sample format conversion between normalized floats and 16-bit PCM.
//!
//! The encoding is asymmetric: negative samples scale by 32768 and
//! non-negative samples by 32767, so both -1.0 and 1.0 hit the extremes of
//! the i16 range. Decoding applies the same split in reverse.

use crate::TransportError;

/// Scale for negative samples.
const NEGATIVE_SCALE: f32 = 32768.0;

/// Scale for non-negative samples.
const POSITIVE_SCALE: f32 = 32767.0;

/// Converts one f32 sample to i16.
///
/// Input is clamped to [-1.0, 1.0] and truncated toward zero after scaling.
/// NaN encodes as 0.
#[inline]
pub fn encode_sample(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * NEGATIVE_SCALE) as i16
    } else {
        (s * POSITIVE_SCALE) as i16
    }
}

/// Converts one little-endian 16-bit word to f32.
#[inline]
pub fn decode_sample(word: u16) -> f32 {
    if word >= 0x8000 {
        -f32::from(0xFFFF - word + 1) / NEGATIVE_SCALE
    } else {
        f32::from(word) / POSITIVE_SCALE
    }
}

/// Encodes `samples` into `out`, which must be the same length.
///
/// Allocation-free; this is what the audio callback path uses.
#[inline]
pub fn encode_into(samples: &[f32], out: &mut [i16]) {
    debug_assert_eq!(samples.len(), out.len());
    for (dst, &src) in out.iter_mut().zip(samples) {
        *dst = encode_sample(src);
    }
}

/// Batch converts f32 samples to i16.
pub fn encode(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| encode_sample(s)).collect()
}

/// Decodes a little-endian 16-bit PCM payload into f32 samples.
///
/// # Errors
///
/// Returns `MalformedPayload` if `bytes` has odd length or holds fewer than
/// one sample.
pub fn decode(bytes: &[u8]) -> Result<Vec<f32>, TransportError> {
    if bytes.len() < 2 || bytes.len() % 2 != 0 {
        return Err(TransportError::MalformedPayload { len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| decode_sample(u16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

/// Serializes i16 samples to their little-endian wire form.
pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}
