//! Builder pattern for voice pipelines.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::boundary;
use crate::pipeline::{EventPump, Exchanger, QueuedFrame};
use crate::processor::{AudioProcessor, ProcessorCounters};
use crate::session::{Session, SessionState};
use crate::transport::{NetworkTransportFactory, TransportFactory};
use crate::{PipelineConfig, PipelineError, PipelineListener, PipelineSettings};

/// Builder for configuring a pipeline.
///
/// Use [`VoicePipeline::builder()`] to create a new builder.
///
/// # Example
///
/// ```no_run
/// use voice_stream::{PipelineListener, PipelineSettings, Protocol, VoicePipeline};
///
/// # async fn run() -> Result<(), voice_stream::PipelineError> {
/// let (session, _processor) = VoicePipeline::builder()
///     .name("mic")
///     .settings(PipelineSettings::new("http://127.0.0.1:18888/", Protocol::Stream)?)
///     .listener(PipelineListener::new().on_exception(|e| eprintln!("{}: {}", e.code, e.message)))
///     .build()?;
///
/// // Hand `processor` to the audio engine; it calls
/// // `process(&input, &mut output)` every render quantum.
/// session.start().await?;
/// # Ok(())
/// # }
/// ```
///
/// [`VoicePipeline::builder()`]: crate::VoicePipeline::builder
#[must_use]
pub struct PipelineBuilder {
    name: String,
    settings: Option<PipelineSettings>,
    config: PipelineConfig,
    listener: PipelineListener,
    factory: Arc<dyn TransportFactory>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            name: "voice".to_string(),
            settings: None,
            config: PipelineConfig::default(),
            listener: PipelineListener::default(),
            factory: Arc::new(NetworkTransportFactory),
        }
    }

    /// Name used in logs and by relaying pipelines.
    ///
    /// Default: `"voice"`
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the runtime settings.
    ///
    /// Default: [`PipelineSettings::local()`]
    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Set custom tuning configuration.
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the listener receiving telemetry and failures.
    pub fn listener(mut self, listener: PipelineListener) -> Self {
        self.listener = listener;
        self
    }

    /// Replace the transport factory.
    ///
    /// Default: [`NetworkTransportFactory`]
    pub fn transport_factory<F: TransportFactory + 'static>(mut self, factory: F) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    /// Builds the pipeline and spawns its background tasks.
    ///
    /// Returns the control [`Session`] and the [`AudioProcessor`] to drive from
    /// the audio engine. The pipeline starts `Idle`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The settings fail validation
    /// - No tokio runtime is running
    /// - The transport cannot be created
    pub fn build(self) -> Result<(Session, AudioProcessor), PipelineError> {
        let settings = match self.settings {
            Some(settings) => settings,
            None => PipelineSettings::local()?,
        };
        settings.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        let (control, events, audio_ends) = boundary::channel(
            &self.name,
            self.config.directive_capacity,
            self.config.event_capacity,
        );
        let counters = Arc::new(ProcessorCounters::default());
        let processor = AudioProcessor::new(
            &self.name,
            audio_ends,
            settings.chunk_block_count,
            self.config.playback_queue_capacity,
            Arc::clone(&counters),
        );

        let (frame_tx, frame_rx) =
            mpsc::channel::<QueuedFrame>(self.config.frame_queue_capacity.max(1));

        let state = Arc::new(SessionState::new(
            self.name,
            self.config,
            settings.clone(),
            self.listener,
            self.factory,
            control,
            counters,
        ));
        state.install_transport(&settings)?;

        let pump_handle = runtime.spawn(EventPump::new(events, Arc::clone(&state), frame_tx).run());
        let exchange_handle = runtime.spawn(Exchanger::new(Arc::clone(&state), frame_rx).run());

        info!(
            pipeline = %state.name,
            block_count = settings.chunk_block_count,
            protocol = %settings.protocol,
            "Pipeline built"
        );

        Ok((Session::new(state, pump_handle, exchange_handle), processor))
    }
}

/// Main entry point for voice-stream.
///
/// Use [`VoicePipeline::builder()`] to start configuring a pipeline.
pub struct VoicePipeline;

impl VoicePipeline {
    /// Creates a new builder for configuring a pipeline.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }
}
