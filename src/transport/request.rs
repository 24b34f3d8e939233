//! Stateless HTTP request/response transport.

use async_trait::async_trait;
use tracing::warn;
use url::Url;

use super::wire::{AudioBytes, VoiceReply, VoiceRequest};
use super::{Transport, TransportContext};
use crate::frame::{PerfVector, RequestFrame, ResponseEnvelope};
use crate::TransportError;

/// Exchanges each frame in its own `POST`.
///
/// Exchanges may overlap; replies are matched to requests by the HTTP call
/// itself, so completion order does not matter.
pub struct RequestTransport {
    url: Url,
    client: reqwest::Client,
}

impl RequestTransport {
    /// Creates a transport posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectFailed` if the HTTP client cannot be built.
    pub fn new(url: Url, ctx: &TransportContext) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(ctx.connect_timeout)
            .timeout(ctx.response_timeout)
            .build()
            .map_err(|e| TransportError::connect_failed(&url, e))?;
        Ok(Self { url, client })
    }

    /// The service URL.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for RequestTransport {
    fn name(&self) -> &str {
        "request"
    }

    fn concurrent(&self) -> bool {
        true
    }

    async fn exchange(
        &self,
        frame: &RequestFrame,
        timestamp_ms: i64,
    ) -> Result<ResponseEnvelope, TransportError> {
        let body = VoiceRequest {
            timestamp: timestamp_ms,
            buffer: AudioBytes(frame.to_le_bytes()),
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::connect_failed(&self.url, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.url, %status, "Backend rejected frame");
            return Err(TransportError::BackendConversion {
                code: format!("HTTP_{}", status.as_u16()),
                message: status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string(),
            });
        }

        let reply: VoiceReply = response
            .json()
            .await
            .map_err(TransportError::invalid_message)?;

        match reply {
            VoiceReply::Failure { details, .. } => {
                warn!(code = %details.code, "Backend reported error: {}", details.message);
                Err(TransportError::from_backend(details.code, details.message))
            }
            VoiceReply::Success { send_timestamp, .. } if send_timestamp != timestamp_ms => {
                warn!(url = %self.url, send_timestamp, "Reply stamped for another frame");
                Err(TransportError::ResponseMismatch {
                    expected: timestamp_ms,
                    received: send_timestamp,
                })
            }
            VoiceReply::Success {
                send_timestamp,
                audio,
                ping,
                vol,
                perf,
            } => ResponseEnvelope {
                sent_at_ms: send_timestamp,
                audio: audio.0,
                round_trip_extra_ms: ping,
                volume: vol,
                perf: PerfVector::from_slice(&perf),
            }
            .validated(),
        }
    }
}
