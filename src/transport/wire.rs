//! JSON wire formats for both transports.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Raw PCM bytes carried as a base64 string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct AudioBytes(pub Vec<u8>);

impl Serialize for AudioBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for AudioBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(AudioBytes)
            .map_err(serde::de::Error::custom)
    }
}

/// Messages exchanged over the stream transport.
///
/// ```text
/// {"event":"request_message","data":[1700000000000,"AAAA..."]}
/// {"event":"response","data":[1700000000000,"AAAA...",12.5,0.031,[0.001,0.02,0.001]]}
/// {"event":"error","data":["ERR_SAMPLE_RATE_NOT_SUPPORTED","..."]}
/// {"event":"server_stats","data":[0.031,[0.001,0.02,0.001]]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub(crate) enum StreamMessage {
    /// Outbound frame: send timestamp, audio.
    RequestMessage(i64, AudioBytes),
    /// Converted frame: send timestamp, audio, ping, volume, perf.
    Response(i64, AudioBytes, f64, f64, Vec<f64>),
    /// Backend failure: code, message.
    Error(String, String),
    /// Unsolicited stats: volume, perf.
    ServerStats(f64, Vec<f64>),
}

/// Body of a request/response call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct VoiceRequest {
    pub timestamp: i64,
    pub buffer: AudioBytes,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorDetails {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Reply to a request/response call.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum VoiceReply {
    Failure {
        #[allow(dead_code)]
        error: bool,
        details: ErrorDetails,
    },
    Success {
        #[serde(rename = "sendTimestamp")]
        send_timestamp: i64,
        audio: AudioBytes,
        #[serde(default)]
        ping: f64,
        #[serde(default)]
        vol: f64,
        #[serde(default)]
        perf: Vec<f64>,
    },
}
