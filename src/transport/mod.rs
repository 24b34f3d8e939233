//! Frame exchange with the conversion backend.
//!
//! A [`Transport`] sends one [`RequestFrame`] and resolves with the converted
//! audio. Two implementations are provided:
//!
//! - [`StreamTransport`]: one persistent WebSocket, exchanges serialized
//! - [`RequestTransport`]: one HTTP POST per frame, exchanges may overlap
//!
//! Which one a pipeline uses is decided by [`Protocol`] through a
//! [`TransportFactory`]. Implement both traits to plug in another backend.

mod request;
mod stream;
pub(crate) mod wire;

pub use request::RequestTransport;
pub use stream::StreamTransport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::config::{PipelineConfig, PipelineSettings, Protocol};
use crate::frame::{PerfVector, RequestFrame, ResponseEnvelope};
use crate::TransportError;

/// Path of the conversion service under the configured endpoint.
pub const SERVICE_PATH: &str = "test";

/// Callback receiving server-pushed volume and perf figures.
pub type ServerStatsCallback = Arc<dyn Fn(f64, PerfVector) + Send + Sync>;

/// A strategy for exchanging frames with the backend.
///
/// # Example
///
/// ```
/// use voice_stream::{RequestFrame, ResponseEnvelope, Transport, TransportError};
/// use async_trait::async_trait;
///
/// struct Offline;
///
/// #[async_trait]
/// impl Transport for Offline {
///     fn name(&self) -> &str {
///         "offline"
///     }
///
///     fn concurrent(&self) -> bool {
///         true
///     }
///
///     async fn exchange(
///         &self,
///         _frame: &RequestFrame,
///         _timestamp_ms: i64,
///     ) -> Result<ResponseEnvelope, TransportError> {
///         Err(TransportError::connect_failed("offline", "no backend"))
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Whether exchanges may run concurrently.
    ///
    /// When `false`, the pipeline issues one exchange at a time in send order.
    fn concurrent(&self) -> bool;

    /// Sends `frame` stamped with `timestamp_ms` and awaits the converted audio.
    ///
    /// Failures are per frame; the pipeline reports them and continues with
    /// the next frame.
    async fn exchange(
        &self,
        frame: &RequestFrame,
        timestamp_ms: i64,
    ) -> Result<ResponseEnvelope, TransportError>;

    /// Releases connections. Called when the transport is replaced or the
    /// session shuts down.
    ///
    /// Default implementation does nothing.
    async fn close(&self) {}
}

/// Everything a transport needs from the pipeline besides its settings.
#[derive(Clone)]
pub struct TransportContext {
    /// Limit for establishing a connection.
    pub connect_timeout: Duration,
    /// Limit for one exchange after the frame is sent.
    pub response_timeout: Duration,
    /// Receives server-pushed stats, if the transport supports them.
    pub on_server_stats: Option<ServerStatsCallback>,
}

impl TransportContext {
    /// Creates a context with the timeouts of `config` and no stats callback.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            response_timeout: config.response_timeout,
            on_server_stats: None,
        }
    }

    pub(crate) fn server_stats(&self, volume: f64, perf: PerfVector) {
        if let Some(ref callback) = self.on_server_stats {
            callback(volume, perf);
        }
    }
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("connect_timeout", &self.connect_timeout)
            .field("response_timeout", &self.response_timeout)
            .field("on_server_stats", &self.on_server_stats.is_some())
            .finish()
    }
}

/// Creates transports for a pipeline's settings.
pub trait TransportFactory: Send + Sync {
    /// Creates a transport for `settings`. Connecting may be deferred to the
    /// first exchange.
    ///
    /// # Errors
    ///
    /// Returns `ConnectFailed` if the endpoint cannot be used.
    fn create(
        &self,
        settings: &PipelineSettings,
        ctx: TransportContext,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Creates a [`StreamTransport`] or [`RequestTransport`] per [`Protocol`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkTransportFactory;

impl TransportFactory for NetworkTransportFactory {
    fn create(
        &self,
        settings: &PipelineSettings,
        ctx: TransportContext,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let url = service_url(&settings.server_endpoint, settings.protocol)?;
        match settings.protocol {
            Protocol::Stream => Ok(Arc::new(StreamTransport::new(url, ctx))),
            Protocol::RequestResponse => Ok(Arc::new(RequestTransport::new(url, &ctx)?)),
        }
    }
}

/// Resolves the service URL for `protocol` under `endpoint`.
///
/// The scheme is switched to match the protocol (http ⇄ ws, https ⇄ wss) and
/// [`SERVICE_PATH`] is joined onto the endpoint path. Endpoints with a path
/// should end in `/`.
///
/// # Errors
///
/// Returns `ConnectFailed` for schemes other than http(s)/ws(s).
pub fn service_url(endpoint: &Url, protocol: Protocol) -> Result<Url, TransportError> {
    let scheme = match (protocol, endpoint.scheme()) {
        (Protocol::Stream, "http" | "ws") => "ws",
        (Protocol::Stream, "https" | "wss") => "wss",
        (Protocol::RequestResponse, "http" | "ws") => "http",
        (Protocol::RequestResponse, "https" | "wss") => "https",
        (_, other) => {
            return Err(TransportError::connect_failed(
                endpoint,
                format!("unsupported scheme '{other}'"),
            ))
        }
    };

    let mut url = endpoint
        .join(SERVICE_PATH)
        .map_err(|e| TransportError::connect_failed(endpoint, e))?;
    url.set_scheme(scheme)
        .map_err(|()| TransportError::connect_failed(endpoint, "cannot switch scheme"))?;
    Ok(url)
}
