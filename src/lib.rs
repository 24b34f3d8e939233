//! # voice-stream
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Real-time audio streaming core for voice-conversion clients.
//!
//! `voice-stream` accumulates microphone audio into fixed-size frames on the
//! audio thread, sends each frame to a conversion backend over WebSocket or
//! HTTP, and plays the converted audio back, either through its own output
//! or relayed into another pipeline.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use voice_stream::{PipelineListener, PipelineSettings, VoicePipeline};
//!
//! let (session, mut processor) = VoicePipeline::builder()
//!     .settings(PipelineSettings::load("pipeline.toml")?)
//!     .listener(
//!         PipelineListener::new()
//!             .on_performance(|s| tracing::info!(rtt = s.total_round_trip_ms, "exchange"))
//!             .on_exception(|e| tracing::warn!(code = %e.code, "{}", e.message)),
//!     )
//!     .build()?;
//!
//! // In the audio callback, every render quantum:
//! //     processor.process(&input, &mut output);
//!
//! session.start().await?;
//! tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//! session.stop().await?;
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict thread boundary:
//!
//! - **Audio Thread**: [`AudioProcessor::process`] never blocks or allocates
//!   on the steady path; frame buffers are recycled through the
//!   [`FrameAccumulator`] pool
//! - **Rings**: lock-free SPSC queues carry directives down and frames and
//!   acknowledgements up
//! - **Tokio Runtime**: the event pump and exchange task talk to the
//!   [`Transport`] and feed converted audio back through
//!   [`Session::playback_port`]
//!
//! Slow networks therefore show up as dropped frames and telemetry, never as
//! audio glitches.
//!
//! [`PipelineBuilder::build`] wires everything together.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod accumulator;
mod boundary;
mod builder;
pub mod codec;
mod config;
mod error;
mod frame;
#[cfg(feature = "cpal-host")]
mod host;
mod lifecycle;
pub mod mock;
mod pipeline;
mod processor;
mod recorder;
mod relay;
mod session;
mod telemetry;
pub mod transport;

pub use accumulator::FrameAccumulator;
pub use boundary::{Directive, PlaybackPort, ProcessorEvent};
pub use builder::{PipelineBuilder, VoicePipeline};
pub use config::{
    PipelineConfig, PipelineSettings, Protocol, DEFAULT_CHUNK_BLOCK_COUNT, DEFAULT_SERVER_ENDPOINT,
};
pub use error::{
    ExceptionCode, PipelineError, PipelineException, TransportError, GENERIC_CONVERSION_MESSAGE,
    SAMPLE_RATE_NOT_SUPPORTED_CODE,
};
pub use frame::{PerfVector, RequestFrame, ResponseEnvelope, BLOCK_SIZE, MIN_RESPONSE_BYTES};
#[cfg(feature = "cpal-host")]
pub use host::AudioHost;
pub use lifecycle::LifecycleState;
pub use processor::AudioProcessor;
pub use recorder::Recorder;
pub use session::{Session, SessionStats};
pub use telemetry::{
    BufferingCallback, ExceptionCallback, PerformanceCallback, PipelineListener,
    TelemetryAggregator, TelemetrySample, TelemetrySummary,
};
pub use transport::{
    service_url, NetworkTransportFactory, RequestTransport, StreamTransport, Transport,
    TransportContext, TransportFactory,
};
