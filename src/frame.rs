//! Request frames and response envelopes.

use crate::codec;
use crate::TransportError;

/// Samples delivered by the audio engine per callback block.
pub const BLOCK_SIZE: usize = 128;

/// Smallest converted payload accepted from the backend, in bytes (one block).
pub const MIN_RESPONSE_BYTES: usize = BLOCK_SIZE * 2;

/// One encoded, fixed-size unit of outbound audio.
///
/// Frames are produced only by the [`FrameAccumulator`](crate::FrameAccumulator)
/// and are read-only from then on.
///
/// # Example
///
/// ```
/// use voice_stream::{FrameAccumulator, BLOCK_SIZE};
///
/// let mut accumulator = FrameAccumulator::new(2);
/// assert!(accumulator.push(&[0.0; BLOCK_SIZE]).is_none());
/// let frame = accumulator.push(&[0.0; BLOCK_SIZE]).unwrap();
///
/// assert_eq!(frame.len(), 256);
/// assert_eq!(frame.to_le_bytes().len(), 512);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    samples: Vec<i16>,
}

impl RequestFrame {
    pub(crate) fn from_samples(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Returns the encoded samples.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Returns the number of samples in the frame.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if the frame holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the number of 128-sample blocks in the frame.
    pub fn block_count(&self) -> usize {
        self.samples.len() / BLOCK_SIZE
    }

    /// Serializes the frame to little-endian PCM bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        codec::samples_to_le_bytes(&self.samples)
    }

    /// Releases the sample buffer so it can be reused.
    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }
}

/// Backend processing times of one exchange, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerfVector {
    /// Pre-processing time.
    pub preprocess: f64,
    /// Model inference time.
    pub main: f64,
    /// Post-processing time.
    pub postprocess: f64,
}

impl PerfVector {
    /// Builds a perf vector from the backend's list, zero-filling missing stages.
    pub fn from_slice(values: &[f64]) -> Self {
        let at = |i: usize| values.get(i).copied().unwrap_or(0.0);
        Self {
            preprocess: at(0),
            main: at(1),
            postprocess: at(2),
        }
    }
}

/// Result of one successful exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    /// Epoch milliseconds at which the request was sent, echoed by the backend.
    pub sent_at_ms: i64,
    /// Converted audio, little-endian 16-bit PCM.
    pub audio: Vec<u8>,
    /// Backend-reported extra latency in milliseconds.
    pub round_trip_extra_ms: f64,
    /// Input volume measured by the backend.
    pub volume: f64,
    /// Backend stage timings.
    pub perf: PerfVector,
}

impl ResponseEnvelope {
    /// Checks the payload against [`MIN_RESPONSE_BYTES`].
    ///
    /// # Errors
    ///
    /// Returns `TruncatedResponse` if the payload is too short.
    pub fn validated(self) -> Result<Self, TransportError> {
        if self.audio.len() < MIN_RESPONSE_BYTES {
            return Err(TransportError::TruncatedResponse {
                len: self.audio.len(),
            });
        }
        Ok(self)
    }

    /// Decodes the payload into f32 samples.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` for odd-length payloads.
    pub fn decode(&self) -> Result<Vec<f32>, TransportError> {
        codec::decode(&self.audio)
    }
}
