//! Mock audio engine and loopback backend for testing without hardware.
//!
//! These allow testing the full pipeline without audio devices or a
//! conversion server, making them suitable for CI environments.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{PipelineSettings, Protocol};
use crate::frame::{PerfVector, RequestFrame, ResponseEnvelope, BLOCK_SIZE};
use crate::processor::AudioProcessor;
use crate::transport::{Transport, TransportContext, TransportFactory};
use crate::{codec, TransportError};

/// Sample rate the mock engine pretends to run at.
pub const MOCK_SAMPLE_RATE: u32 = 48_000;

/// Signal fed to the processor by a [`MockEngine`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockInput {
    /// All zeros.
    Silence,
    /// A constant level.
    Constant(f32),
    /// A sine wave.
    Sine {
        /// Frequency in Hz.
        frequency: f32,
        /// Peak amplitude.
        amplitude: f32,
    },
}

impl MockInput {
    fn fill(&self, block: &mut [f32], position: &mut u64) {
        for sample in block.iter_mut() {
            *sample = match *self {
                Self::Silence => 0.0,
                Self::Constant(level) => level,
                Self::Sine {
                    frequency,
                    amplitude,
                } => {
                    let t = *position as f64 / f64::from(MOCK_SAMPLE_RATE);
                    (amplitude as f64 * (2.0 * std::f64::consts::PI * frequency as f64 * t).sin())
                        as f32
                }
            };
            *position += 1;
        }
    }
}

/// Simulated audio engine driving an [`AudioProcessor`] from its own thread.
///
/// Every `quantum` the engine feeds one 128-sample block of input and keeps
/// the rendered output for inspection.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use voice_stream::mock::{LoopbackFactory, MockEngine, MockInput};
/// use voice_stream::VoicePipeline;
///
/// # async fn run() -> Result<(), voice_stream::PipelineError> {
/// let (session, processor) = VoicePipeline::builder()
///     .transport_factory(LoopbackFactory::new())
///     .build()?;
/// let engine = MockEngine::spawn(processor, MockInput::Constant(0.5), Duration::from_millis(1));
///
/// session.start().await?;
/// tokio::time::sleep(Duration::from_millis(200)).await;
/// session.stop().await?;
///
/// let played = engine.rendered();
/// # Ok(())
/// # }
/// ```
pub struct MockEngine {
    stop: Arc<AtomicBool>,
    rendered: Arc<Mutex<Vec<f32>>>,
    handle: Option<thread::JoinHandle<AudioProcessor>>,
}

impl MockEngine {
    /// Starts driving `processor` every `quantum`.
    pub fn spawn(mut processor: AudioProcessor, input: MockInput, quantum: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let rendered = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let stop = Arc::clone(&stop);
            let rendered = Arc::clone(&rendered);
            thread::spawn(move || {
                let mut block = [0.0f32; BLOCK_SIZE];
                let mut output = [0.0f32; BLOCK_SIZE];
                let mut position = 0u64;

                while !stop.load(Ordering::SeqCst) {
                    input.fill(&mut block, &mut position);
                    processor.process(&block, &mut output);
                    rendered.lock().extend_from_slice(&output);
                    thread::sleep(quantum);
                }
                processor
            })
        };

        Self {
            stop,
            rendered,
            handle: Some(handle),
        }
    }

    /// Returns a copy of everything rendered so far.
    pub fn rendered(&self) -> Vec<f32> {
        self.rendered.lock().clone()
    }

    /// Takes everything rendered so far, clearing the internal buffer.
    pub fn take_rendered(&self) -> Vec<f32> {
        std::mem::take(&mut *self.rendered.lock())
    }

    /// Stops the engine thread and hands the processor back.
    pub fn stop(mut self) -> Option<AudioProcessor> {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.take().and_then(|h| h.join().ok())
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Backend that echoes every frame back as its "converted" audio.
///
/// Volume is the RMS of the frame. Failures can be scripted with
/// [`fail_next()`](Self::fail_next).
pub struct LoopbackTransport {
    name: String,
    concurrent: bool,
    delay: Duration,
    ping_ms: f64,
    exchanges: AtomicU64,
    failures: Mutex<VecDeque<TransportError>>,
}

impl LoopbackTransport {
    /// Creates a serialized loopback with no delay.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrent: false,
            delay: Duration::ZERO,
            ping_ms: 0.0,
            exchanges: AtomicU64::new(0),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Allows concurrent exchanges.
    #[must_use]
    pub fn with_concurrency(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// Delays every exchange.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Reports `ping_ms` of backend latency in every response.
    #[must_use]
    pub fn with_ping(mut self, ping_ms: f64) -> Self {
        self.ping_ms = ping_ms;
        self
    }

    /// Makes the next exchange fail with `err`.
    pub fn fail_next(&self, err: TransportError) {
        self.failures.lock().push_back(err);
    }

    /// Exchanges attempted so far.
    pub fn exchanges(&self) -> u64 {
        self.exchanges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn concurrent(&self) -> bool {
        self.concurrent
    }

    async fn exchange(
        &self,
        frame: &RequestFrame,
        timestamp_ms: i64,
    ) -> Result<ResponseEnvelope, TransportError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }

        let audio = frame.to_le_bytes();
        let samples = codec::decode(&audio)?;
        let volume = if samples.is_empty() {
            0.0
        } else {
            let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
            (sum / samples.len() as f64).sqrt()
        };

        ResponseEnvelope {
            sent_at_ms: timestamp_ms,
            audio,
            round_trip_extra_ms: self.ping_ms,
            volume,
            perf: PerfVector {
                preprocess: 0.001,
                main: 0.002,
                postprocess: 0.001,
            },
        }
        .validated()
    }
}

#[derive(Default)]
struct FactoryInner {
    created: AtomicU64,
    delay: Mutex<Duration>,
    latest: Mutex<Option<Arc<LoopbackTransport>>>,
}

/// Creates [`LoopbackTransport`]s, mirroring the concurrency of the real
/// transport for each protocol.
///
/// Clones share state, so a test can keep one clone and hand the other to
/// the builder.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    inner: Arc<FactoryInner>,
}

impl LoopbackFactory {
    /// Creates a factory producing undelayed loopbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every exchange of transports created from now on.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.inner.delay.lock() = delay;
        self
    }

    /// Number of transports created.
    pub fn created(&self) -> u64 {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// The most recently created transport.
    pub fn latest(&self) -> Option<Arc<LoopbackTransport>> {
        self.inner.latest.lock().clone()
    }
}

impl TransportFactory for LoopbackFactory {
    fn create(
        &self,
        settings: &PipelineSettings,
        _ctx: TransportContext,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let (name, concurrent) = match settings.protocol {
            Protocol::Stream => ("loopback-stream", false),
            Protocol::RequestResponse => ("loopback-request", true),
        };
        let transport = Arc::new(
            LoopbackTransport::new(name)
                .with_concurrency(concurrent)
                .with_delay(*self.inner.delay.lock()),
        );

        self.inner.created.fetch_add(1, Ordering::SeqCst);
        *self.inner.latest.lock() = Some(Arc::clone(&transport));
        Ok(transport)
    }
}
