//! Pipeline session management.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::boundary::{ControlPort, Directive, PlaybackPort};
use crate::frame::RequestFrame;
use crate::lifecycle::{Lifecycle, LifecycleState, Transition};
use crate::processor::ProcessorCounters;
use crate::recorder::Recorder;
use crate::relay::OutputRelay;
use crate::telemetry::{PipelineListener, TelemetryAggregator, TelemetrySummary};
use crate::transport::{Transport, TransportContext, TransportFactory};
use crate::{PipelineConfig, PipelineError, PipelineSettings, TransportError};

/// Statistics about a pipeline session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// `Start` directives the audio engine has applied.
    pub start_directives: u64,
    /// Frames completed by the accumulator and handed to the control side.
    pub frames_emitted: u64,
    /// Frames handed to the transport.
    pub frames_sent: u64,
    /// Frames dropped before sending (full queues, halted or stopped pipeline).
    pub frames_dropped: u64,
    /// Exchanges that produced playable audio.
    pub exchanges_completed: u64,
    /// Exchanges that failed.
    pub exchange_failures: u64,
    /// Responses discarded because the pipeline was stopped meanwhile.
    pub late_responses_dropped: u64,
    /// Output samples zero-filled while running.
    pub underrun_samples: u64,
    /// Playback buffers dropped because the queue was full.
    pub playback_overflows: u64,
    /// Frames for which the accumulator had to allocate.
    pub pool_misses: u64,
}

/// The transport in use, the settings it was created for and its epoch.
pub(crate) struct TransportSlot {
    pub transport: Arc<dyn Transport>,
    pub settings: PipelineSettings,
    pub epoch: u64,
}

/// Internal state shared between Session and background tasks.
pub(crate) struct SessionState {
    pub name: String,
    pub config: PipelineConfig,
    pub listener: PipelineListener,
    pub factory: Arc<dyn TransportFactory>,
    pub control: ControlPort,
    pub processor: Arc<ProcessorCounters>,
    pub lifecycle: Mutex<Lifecycle>,
    pub settings: RwLock<PipelineSettings>,
    pub transport: RwLock<Option<TransportSlot>>,
    pub relay: OutputRelay,
    pub recorder: Mutex<Recorder>,
    pub telemetry: Mutex<TelemetryAggregator>,
    pub generation: watch::Sender<u64>,
    /// Bumped whenever the transport is replaced or retired.
    pub transport_epoch: watch::Sender<u64>,
    pub halted: AtomicBool,
    pub closed: AtomicBool,
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub exchanges_completed: AtomicU64,
    pub exchange_failures: AtomicU64,
    pub late_responses: AtomicU64,
}

impl SessionState {
    pub fn new(
        name: String,
        config: PipelineConfig,
        settings: PipelineSettings,
        listener: PipelineListener,
        factory: Arc<dyn TransportFactory>,
        control: ControlPort,
        processor: Arc<ProcessorCounters>,
    ) -> Self {
        let relay = OutputRelay::new(PlaybackPort::new(control.clone()));
        Self {
            name,
            config,
            listener,
            factory,
            control,
            processor,
            lifecycle: Mutex::new(Lifecycle::default()),
            settings: RwLock::new(settings),
            transport: RwLock::new(None),
            relay,
            recorder: Mutex::new(Recorder::new()),
            telemetry: Mutex::new(TelemetryAggregator::new()),
            generation: watch::channel(0).0,
            transport_epoch: watch::channel(0).0,
            halted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            exchanges_completed: AtomicU64::new(0),
            exchange_failures: AtomicU64::new(0),
            late_responses: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().state() == LifecycleState::Running
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    pub fn transport_epoch(&self) -> u64 {
        *self.transport_epoch.borrow()
    }

    /// The installed transport and the epoch it belongs to.
    pub fn current_transport(&self) -> Option<(Arc<dyn Transport>, u64)> {
        self.transport
            .read()
            .as_ref()
            .map(|slot| (Arc::clone(&slot.transport), slot.epoch))
    }

    /// Hands a spent frame buffer back to the processor.
    pub fn recycle(&self, frame: RequestFrame) {
        // A full directive ring just means the pool refills later.
        let _ = self.control.post(Directive::Recycle(frame.into_samples()));
    }

    /// Counts a frame dropped before sending and returns its buffer.
    pub fn drop_frame(&self, frame: RequestFrame) {
        self.frames_dropped.fetch_add(1, Ordering::SeqCst);
        self.recycle(frame);
    }

    fn transport_context(self: &Arc<Self>) -> TransportContext {
        let weak = Arc::downgrade(self);
        let mut ctx = TransportContext::from_config(&self.config);
        ctx.on_server_stats = Some(Arc::new(move |volume, perf| {
            if let Some(state) = weak.upgrade() {
                let sample = state.telemetry.lock().server_stats(volume, perf);
                state.listener.performance(&sample);
            }
        }));
        ctx
    }

    /// Creates a transport for `settings` and installs it, returning the
    /// replaced one.
    pub fn install_transport(
        self: &Arc<Self>,
        settings: &PipelineSettings,
    ) -> Result<Option<Arc<dyn Transport>>, TransportError> {
        let transport = self.factory.create(settings, self.transport_context())?;
        info!(
            pipeline = %self.name,
            transport = transport.name(),
            endpoint = %settings.server_endpoint,
            "Transport installed"
        );
        let mut slot = self.transport.write();
        let epoch = self.next_transport_epoch();
        let previous = slot.replace(TransportSlot {
            transport,
            settings: settings.clone(),
            epoch,
        });
        Ok(previous.map(|slot| slot.transport))
    }

    /// Removes the transport, abandoning its in-flight exchanges.
    pub fn retire_transport(&self) -> Option<Arc<dyn Transport>> {
        let mut slot = self.transport.write();
        self.next_transport_epoch();
        slot.take().map(|slot| slot.transport)
    }

    fn next_transport_epoch(&self) -> u64 {
        let mut epoch = 0;
        self.transport_epoch.send_modify(|e| {
            *e += 1;
            epoch = *e;
        });
        epoch
    }

    fn transport_settings(&self) -> Option<PipelineSettings> {
        self.transport.read().as_ref().map(|slot| slot.settings.clone())
    }
}

/// Handle to a voice pipeline.
///
/// The `Session` is returned by [`PipelineBuilder::build()`] together with the
/// [`AudioProcessor`](crate::AudioProcessor) that runs in the audio engine.
/// Background tasks run until [`shutdown()`](Session::shutdown) is called or
/// the `Session` is dropped.
///
/// # Lifecycle
///
/// 1. Created by [`PipelineBuilder::build()`] in the `Idle` state
/// 2. [`start()`](Session::start) begins capturing and converting
/// 3. [`stop()`](Session::stop) halts capture and abandons in-flight exchanges
/// 4. [`shutdown()`](Session::shutdown) closes the transport and joins tasks
///
/// # Example
///
/// ```ignore
/// let (session, processor) = VoicePipeline::builder()
///     .settings(PipelineSettings::load("pipeline.toml")?)
///     .listener(PipelineListener::new().on_exception(|e| eprintln!("{e:?}")))
///     .build()?;
///
/// // Move `processor` into the audio callback, then:
/// session.start().await?;
/// tokio::time::sleep(Duration::from_secs(10)).await;
/// session.stop().await?;
/// ```
///
/// [`PipelineBuilder::build()`]: crate::PipelineBuilder::build
pub struct Session {
    state: Arc<SessionState>,
    pump_handle: Option<JoinHandle<()>>,
    exchange_handle: Option<JoinHandle<()>>,
}

impl Session {
    pub(crate) fn new(
        state: Arc<SessionState>,
        pump_handle: JoinHandle<()>,
        exchange_handle: JoinHandle<()>,
    ) -> Self {
        Self {
            state,
            pump_handle: Some(pump_handle),
            exchange_handle: Some(exchange_handle),
        }
    }

    /// Name of the pipeline.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state.lifecycle.lock().state()
    }

    /// Current settings.
    pub fn settings(&self) -> PipelineSettings {
        self.state.settings.read().clone()
    }

    /// Returns `true` if sending is halted by an unsupported sample rate.
    pub fn is_halted(&self) -> bool {
        self.state.halted.load(Ordering::SeqCst)
    }

    /// Returns current session statistics.
    pub fn stats(&self) -> SessionStats {
        let processor = &self.state.processor;
        SessionStats {
            start_directives: processor.starts_handled.load(Ordering::SeqCst),
            frames_emitted: processor.frames_emitted.load(Ordering::SeqCst),
            frames_sent: self.state.frames_sent.load(Ordering::SeqCst),
            frames_dropped: processor.frames_dropped.load(Ordering::SeqCst)
                + self.state.frames_dropped.load(Ordering::SeqCst),
            exchanges_completed: self.state.exchanges_completed.load(Ordering::SeqCst),
            exchange_failures: self.state.exchange_failures.load(Ordering::SeqCst),
            late_responses_dropped: self.state.late_responses.load(Ordering::SeqCst),
            underrun_samples: processor.underrun_samples.load(Ordering::SeqCst),
            playback_overflows: processor.playback_overflows.load(Ordering::SeqCst),
            pool_misses: processor.pool_misses.load(Ordering::SeqCst),
        }
    }

    /// Round-trip summary since the last start.
    pub fn telemetry(&self) -> TelemetrySummary {
        self.state.telemetry.lock().summary()
    }

    /// Port for relaying another pipeline's output into this one's playback.
    pub fn playback_port(&self) -> PlaybackPort {
        PlaybackPort::new(self.state.control.clone())
    }

    /// Starts capturing and converting.
    ///
    /// Resolves once the audio engine acknowledges. Calling this while
    /// already running resolves immediately without contacting the engine.
    ///
    /// # Errors
    ///
    /// Returns `TransitionInProgress` if a start or stop is pending,
    /// `AcknowledgementTimeout` if the audio engine does not respond, and
    /// `Closed` after shutdown.
    ///
    /// After a timeout the state rolls back, but the directive stays queued.
    /// If the audio engine applies it later, [`state()`](Session::state)
    /// follows. The same holds for [`stop()`](Session::stop).
    pub async fn start(&self) -> Result<(), PipelineError> {
        self.ensure_open()?;
        let block_count = self.state.settings.read().chunk_block_count;

        let transition = self.state.lifecycle.lock().request_start()?;
        let Transition::Pending(ack) = transition else {
            debug!(pipeline = %self.state.name, "Start requested while running");
            return Ok(());
        };

        self.state.telemetry.lock().reset(Instant::now());
        self.post_transition(Directive::Start { block_count })?;
        self.await_ack(ack, "start").await?;

        info!(pipeline = %self.state.name, block_count, "Pipeline started");
        Ok(())
    }

    /// Stops capturing and abandons in-flight exchanges.
    ///
    /// Responses that arrive afterwards are dropped without playback,
    /// recording or telemetry. Calling this while idle resolves immediately.
    ///
    /// # Errors
    ///
    /// Returns `TransitionInProgress` if a start or stop is pending and
    /// `AcknowledgementTimeout` if the audio engine does not respond.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let transition = self.state.lifecycle.lock().request_stop()?;
        let Transition::Pending(ack) = transition else {
            return Ok(());
        };

        self.state.generation.send_modify(|g| *g += 1);
        self.post_transition(Directive::Stop)?;
        self.await_ack(ack, "stop").await?;

        info!(pipeline = %self.state.name, "Pipeline stopped");
        Ok(())
    }

    /// Discards queued playback audio and the partially accumulated frame.
    ///
    /// Does not wait for the audio engine and does not change the lifecycle
    /// state.
    ///
    /// # Errors
    ///
    /// Returns `DirectiveQueueFull` if the audio engine is not draining
    /// directives.
    pub fn truncate_buffer(&self) -> Result<(), PipelineError> {
        self.ensure_open()?;
        debug!(pipeline = %self.state.name, "Truncating buffers");
        self.state.control.post(Directive::TruncateBuffer)
    }

    /// Applies new settings.
    ///
    /// A changed block count reallocates the frame buffer (discarding the
    /// partial frame). A changed protocol or endpoint replaces the transport,
    /// unless a relay target is set, in which case the current transport is
    /// kept. Exchanges still in flight on a replaced transport are abandoned
    /// and their results discarded. Clears a halt caused by an unsupported
    /// sample rate.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSettings` if validation fails and `Transport` if the
    /// new transport cannot be created.
    pub async fn reconfigure(&self, settings: PipelineSettings) -> Result<(), PipelineError> {
        self.ensure_open()?;
        settings.validate()?;

        let previous = self.settings();
        if settings.chunk_block_count != previous.chunk_block_count {
            self.state.control.post(Directive::Configure {
                block_count: settings.chunk_block_count,
            })?;
        }
        *self.state.settings.write() = settings.clone();
        self.state.halted.store(false, Ordering::SeqCst);

        let needs_transport = self
            .state
            .transport_settings()
            .map_or(true, |current| current.transport_changed(&settings));

        if needs_transport {
            if self.state.relay.is_active() {
                info!(
                    pipeline = %self.state.name,
                    relay = ?self.state.relay.target_name(),
                    "Relay active, keeping current transport"
                );
            } else if let Some(old) = self.state.install_transport(&settings)? {
                old.close().await;
            }
        }

        info!(
            pipeline = %self.state.name,
            block_count = settings.chunk_block_count,
            protocol = %settings.protocol,
            "Pipeline reconfigured"
        );
        Ok(())
    }

    /// Redirects converted output into another pipeline's playback, or back
    /// to this pipeline's own when `None`.
    pub fn set_relay_target(&self, target: Option<PlaybackPort>) {
        match &target {
            Some(port) => info!(pipeline = %self.state.name, target = port.name(), "Relaying output"),
            None => info!(pipeline = %self.state.name, "Relay cleared"),
        }
        self.state.relay.set_target(target);
    }

    /// Starts recording converted output, clearing any previous recording.
    pub fn arm_recording(&self) {
        self.state.recorder.lock().arm();
    }

    /// Stops recording and returns the captured audio.
    pub fn disarm_recording(&self) -> Vec<f32> {
        self.state.recorder.lock().disarm()
    }

    /// Stops the pipeline, closes the transport and waits for background
    /// tasks to finish.
    ///
    /// Further calls to `start`, `truncate_buffer` and `reconfigure` fail with
    /// `Closed`.
    ///
    /// # Errors
    ///
    /// Returns an error if stopping fails; the session is closed regardless.
    pub async fn shutdown(&mut self) -> Result<(), PipelineError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let stopped = if self.state.is_running() {
            self.stop().await
        } else {
            Ok(())
        };

        self.state.closed.store(true, Ordering::SeqCst);
        self.state.generation.send_modify(|g| *g += 1);

        if let Some(transport) = self.state.retire_transport() {
            transport.close().await;
        }

        if let Some(handle) = self.pump_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.exchange_handle.take() {
            let _ = handle.await;
        }

        info!(pipeline = %self.state.name, "Session shut down");
        stopped
    }

    fn ensure_open(&self) -> Result<(), PipelineError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::Closed);
        }
        Ok(())
    }

    fn post_transition(&self, directive: Directive) -> Result<(), PipelineError> {
        self.state.control.post(directive).map_err(|e| {
            self.state.lifecycle.lock().abort();
            e
        })
    }

    async fn await_ack(
        &self,
        ack: oneshot::Receiver<()>,
        directive: &'static str,
    ) -> Result<(), PipelineError> {
        match tokio::time::timeout(self.state.config.ack_timeout, ack).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.state.lifecycle.lock().abort();
                Err(PipelineError::AcknowledgementLost { directive })
            }
            Err(_) => {
                self.state.lifecycle.lock().expire();
                warn!(pipeline = %self.state.name, directive, "Acknowledgement timed out");
                Err(PipelineError::AcknowledgementTimeout { directive })
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            // Dropped without shutdown(); background tasks exit on their next poll.
            self.state.generation.send_modify(|g| *g += 1);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.state.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
