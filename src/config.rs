//! Configuration types for voice pipelines.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::frame::BLOCK_SIZE;
use crate::PipelineError;

/// Default number of 128-sample blocks per request frame.
pub const DEFAULT_CHUNK_BLOCK_COUNT: usize = 48;

/// Default conversion backend.
pub const DEFAULT_SERVER_ENDPOINT: &str = "http://127.0.0.1:18888/";

/// Wire strategy used to exchange frames with the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Protocol {
    /// One persistent bidirectional connection; exchanges are serialized.
    #[default]
    #[serde(rename = "sio", alias = "stream")]
    Stream,
    /// One stateless call per frame; exchanges may overlap.
    #[serde(rename = "rest", alias = "request_response")]
    RequestResponse,
}

impl Protocol {
    /// Returns the settings-file name of this protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "sio",
            Self::RequestResponse => "rest",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sio" | "stream" => Ok(Self::Stream),
            "rest" | "request_response" => Ok(Self::RequestResponse),
            other => Err(PipelineError::invalid_settings(format!(
                "unknown protocol '{other}'"
            ))),
        }
    }
}

/// Runtime settings of a pipeline.
///
/// Changed only through [`Session::reconfigure()`](crate::Session::reconfigure),
/// which reallocates the frame buffer and recreates the transport as needed.
///
/// # Example
///
/// ```
/// use voice_stream::{PipelineSettings, Protocol};
///
/// let settings = PipelineSettings::from_toml_str(
///     r#"
///     chunk_block_count = 24
///     protocol = "rest"
///     server_endpoint = "http://192.168.0.3:18888/"
///     "#,
/// )
/// .unwrap();
/// assert_eq!(settings.protocol, Protocol::RequestResponse);
/// assert_eq!(settings.frame_len(), 24 * 128);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Number of 128-sample blocks per request frame.
    pub chunk_block_count: usize,
    /// Wire strategy.
    #[serde(default)]
    pub protocol: Protocol,
    /// Base URL of the conversion backend.
    pub server_endpoint: Url,
}

impl PipelineSettings {
    /// Settings for a backend at [`DEFAULT_SERVER_ENDPOINT`] with default
    /// chunking and protocol.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSettings` if the default endpoint does not parse.
    pub fn local() -> Result<Self, PipelineError> {
        Self::new(DEFAULT_SERVER_ENDPOINT, Protocol::default())
    }

    /// Creates settings for the given endpoint with default chunking.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSettings` if the endpoint is not a valid URL.
    pub fn new(endpoint: &str, protocol: Protocol) -> Result<Self, PipelineError> {
        let server_endpoint = Url::parse(endpoint)
            .map_err(|e| PipelineError::invalid_settings(format!("server_endpoint: {e}")))?;
        let settings = Self {
            chunk_block_count: DEFAULT_CHUNK_BLOCK_COUNT,
            protocol,
            server_endpoint,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Sets the block count, returning the modified settings.
    #[must_use]
    pub fn with_chunk_block_count(mut self, chunk_block_count: usize) -> Self {
        self.chunk_block_count = chunk_block_count;
        self
    }

    /// Parses settings from TOML.
    ///
    /// # Errors
    ///
    /// Returns `Config` on parse failure and `InvalidSettings` if validation fails.
    pub fn from_toml_str(source: &str) -> Result<Self, PipelineError> {
        let settings: Self =
            toml::from_str(source).map_err(|e| PipelineError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file can't be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Checks the invariants the pipeline relies on.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSettings` for a zero block count or an unsupported URL scheme.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.chunk_block_count == 0 {
            return Err(PipelineError::invalid_settings(
                "chunk_block_count must be positive",
            ));
        }
        match self.server_endpoint.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(()),
            other => Err(PipelineError::invalid_settings(format!(
                "server_endpoint: unsupported scheme '{other}'"
            ))),
        }
    }

    /// Number of samples in one request frame.
    pub fn frame_len(&self) -> usize {
        self.chunk_block_count * BLOCK_SIZE
    }

    /// Returns `true` if switching to `other` requires a new transport.
    pub fn transport_changed(&self, other: &Self) -> bool {
        self.protocol != other.protocol || self.server_endpoint != other.server_endpoint
    }
}

/// Tuning knobs for the control side of a pipeline.
///
/// Use [`PipelineConfig::default()`] for sensible defaults, or customize as needed.
///
/// # Example
///
/// ```
/// use voice_stream::PipelineConfig;
/// use std::time::Duration;
///
/// let config = PipelineConfig {
///     poll_interval: Duration::from_millis(2),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How often the event pump drains the processor's event ring.
    ///
    /// Default: 5ms
    pub poll_interval: Duration,

    /// How long `start()`/`stop()` wait for the audio engine's acknowledgement.
    ///
    /// Default: 2 seconds
    pub ack_timeout: Duration,

    /// Timeout for establishing a transport connection.
    ///
    /// Default: 5 seconds
    pub connect_timeout: Duration,

    /// Timeout for one exchange once the frame is sent.
    ///
    /// Default: 10 seconds
    pub response_timeout: Duration,

    /// Frames waiting for the transport. Further frames are dropped.
    ///
    /// Default: 8
    pub frame_queue_capacity: usize,

    /// Capacity of the directive ring (control → audio).
    ///
    /// Default: 64
    pub directive_capacity: usize,

    /// Capacity of the event ring (audio → control).
    ///
    /// Default: 64
    pub event_capacity: usize,

    /// Decoded buffers the processor queues for playback before dropping the oldest.
    ///
    /// Default: 32
    pub playback_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            ack_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(10),
            frame_queue_capacity: 8,
            directive_capacity: 64,
            event_capacity: 64,
            playback_queue_capacity: 32,
        }
    }
}
