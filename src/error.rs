//! Error types for voice-stream.
//!
//! Errors are split into two categories:
//! - **Control-plane errors** ([`PipelineError`]): returned from session and
//!   builder calls (start/stop/reconfigure)
//! - **Exchange failures** ([`TransportError`]): raised per frame by a
//!   [`Transport`](crate::Transport) and surfaced to the exception listener as
//!   a [`PipelineException`], never across the audio boundary

use std::fmt;

use crate::lifecycle::LifecycleState;

/// Backend error code that is passed through to the listener verbatim.
pub const SAMPLE_RATE_NOT_SUPPORTED_CODE: &str = "ERR_SAMPLE_RATE_NOT_SUPPORTED";

/// Message shown for every backend failure other than an unsupported sample rate.
pub const GENERIC_CONVERSION_MESSAGE: &str =
    "An error occurred during voice conversion. Check the server log for more details.";

/// Failure of a single frame exchange.
///
/// None of these stop the pipeline: the frame is dropped, the exception
/// listener is notified, and the next frame is attempted. The one exception is
/// [`SampleRateNotSupported`](TransportError::SampleRateNotSupported), which
/// halts sending until the session is reconfigured.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The transport could not establish or keep its connection.
    #[error("connection to {endpoint} failed: {reason}")]
    ConnectFailed {
        /// Endpoint that was being contacted.
        endpoint: String,
        /// What went wrong.
        reason: String,
    },

    /// The backend rejected the configured sample rate.
    #[error("{message}")]
    SampleRateNotSupported {
        /// Backend-provided message, passed through unchanged.
        message: String,
    },

    /// Any other failure reported by the backend.
    #[error("backend conversion failed ({code}): {message}")]
    BackendConversion {
        /// Backend error code.
        code: String,
        /// Backend error message.
        message: String,
    },

    /// The converted payload is below the minimum viable frame.
    #[error("received data is too short: {len} bytes")]
    TruncatedResponse {
        /// Payload length in bytes.
        len: usize,
    },

    /// The payload is not a sequence of 16-bit samples.
    #[error("malformed audio payload of {len} bytes")]
    MalformedPayload {
        /// Payload length in bytes.
        len: usize,
    },

    /// A response carried a timestamp other than the one of the request in flight.
    #[error("response for frame {received} arrived while awaiting frame {expected}")]
    ResponseMismatch {
        /// Timestamp of the request in flight.
        expected: i64,
        /// Timestamp carried by the response.
        received: i64,
    },

    /// The backend sent a message that could not be decoded.
    #[error("invalid message from backend: {reason}")]
    InvalidMessage {
        /// Decoder error.
        reason: String,
    },
}

impl TransportError {
    /// Maps a backend-reported error code onto a transport error.
    ///
    /// Only [`SAMPLE_RATE_NOT_SUPPORTED_CODE`] keeps its identity; every other
    /// code becomes [`BackendConversion`](TransportError::BackendConversion).
    pub fn from_backend(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        if code == SAMPLE_RATE_NOT_SUPPORTED_CODE {
            Self::SampleRateNotSupported { message }
        } else {
            Self::BackendConversion { code, message }
        }
    }

    /// Creates a connection failure for the given endpoint.
    pub fn connect_failed(endpoint: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::ConnectFailed {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Creates an invalid-message error from a decoder failure.
    pub fn invalid_message(reason: impl fmt::Display) -> Self {
        Self::InvalidMessage {
            reason: reason.to_string(),
        }
    }

    /// Returns `true` if this error halts sending until reconfiguration.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SampleRateNotSupported { .. })
    }

    /// Converts this error into the notification delivered to the listener.
    pub fn to_exception(&self) -> PipelineException {
        match self {
            Self::ConnectFailed { .. } => {
                PipelineException::new(ExceptionCode::ConnectFailed, self.to_string())
            }
            Self::SampleRateNotSupported { message } => {
                PipelineException::new(ExceptionCode::SampleRateNotSupported, message.clone())
            }
            Self::BackendConversion { .. } => PipelineException::new(
                ExceptionCode::GenericConversion,
                GENERIC_CONVERSION_MESSAGE,
            ),
            Self::TruncatedResponse { .. }
            | Self::MalformedPayload { .. }
            | Self::ResponseMismatch { .. }
            | Self::InvalidMessage { .. } => {
                PipelineException::new(ExceptionCode::InvalidResponse, self.to_string())
            }
        }
    }
}

/// Exception codes surfaced to the exception listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    /// The transport could not connect.
    ConnectFailed,
    /// The backend response was unusable.
    InvalidResponse,
    /// The backend does not support the configured sample rate.
    SampleRateNotSupported,
    /// Any other backend failure.
    GenericConversion,
}

impl ExceptionCode {
    /// Returns the wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectFailed => "ERR_SIO_CONNECT_FAILED",
            Self::InvalidResponse => "ERR_SIO_INVALID_RESPONSE",
            Self::SampleRateNotSupported => SAMPLE_RATE_NOT_SUPPORTED_CODE,
            Self::GenericConversion => "ERR_GENERIC_VOICE_CHANGER_EXCEPTION",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-visible failure notification.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineException {
    /// Machine-readable code.
    pub code: ExceptionCode,
    /// Human-readable message.
    pub message: String,
}

impl PipelineException {
    /// Creates a new exception notification.
    pub fn new(code: ExceptionCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors returned from control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Settings failed validation.
    #[error("invalid settings: {reason}")]
    InvalidSettings {
        /// Which field is wrong and why.
        reason: String,
    },

    /// Another start/stop is still awaiting its acknowledgement.
    #[error("lifecycle transition already in progress (state: {state:?})")]
    TransitionInProgress {
        /// State at the time of the request.
        state: LifecycleState,
    },

    /// The audio engine did not acknowledge a directive in time.
    #[error("audio engine did not acknowledge '{directive}' in time")]
    AcknowledgementTimeout {
        /// Directive that went unacknowledged.
        directive: &'static str,
    },

    /// The acknowledgement token was dropped before it resolved.
    #[error("acknowledgement for '{directive}' was lost")]
    AcknowledgementLost {
        /// Directive whose acknowledgement was lost.
        directive: &'static str,
    },

    /// The directive ring is full; the audio engine is not draining it.
    #[error("directive queue full, '{directive}' not delivered")]
    DirectiveQueueFull {
        /// Directive that could not be posted.
        directive: &'static str,
    },

    /// The pipeline must be built from within a tokio runtime.
    #[error("no tokio runtime available - build the pipeline inside a runtime")]
    NoRuntime,

    /// The session was shut down.
    #[error("session is shut down")]
    Closed,

    /// Creating or closing a transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Settings could not be read or parsed.
    #[error("settings error: {0}")]
    Config(String),

    /// The audio host (device I/O) failed.
    #[error("audio host error: {0}")]
    Host(String),
}

impl PipelineError {
    /// Creates an invalid-settings error with the given reason.
    pub fn invalid_settings(reason: impl Into<String>) -> Self {
        Self::InvalidSettings {
            reason: reason.into(),
        }
    }
}
