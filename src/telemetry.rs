//! Latency and backend performance telemetry, and the listener that receives it.
//!
//! Notifications are informational. The pipeline keeps running after any of
//! them is delivered; they are for display and metrics, not control flow.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::error::PipelineException;
use crate::frame::{PerfVector, ResponseEnvelope};

/// Timing and level figures for one completed exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetrySample {
    /// Milliseconds between the two most recent completed frames.
    pub buffering_interval_ms: u64,
    /// Send-to-receive time plus the backend-reported extra latency.
    ///
    /// Zero for server-pushed stats.
    pub total_round_trip_ms: f64,
    /// Input volume measured by the backend.
    pub volume: f64,
    /// Backend pre-processing time, rounded up to whole milliseconds.
    pub preprocess_ms: u64,
    /// Backend inference time, rounded up to whole milliseconds.
    pub main_ms: u64,
    /// Backend post-processing time, rounded up to whole milliseconds.
    pub post_ms: u64,
}

/// Rolling summary of a session's exchanges.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetrySummary {
    /// Exchanges completed since the last start.
    pub exchanges: u64,
    /// Mean total round trip, in milliseconds.
    pub mean_round_trip_ms: f64,
    /// Most recent exchange sample.
    pub last: Option<TelemetrySample>,
}

fn seconds_to_ceil_ms(seconds: f64) -> u64 {
    (seconds * 1000.0).ceil().max(0.0) as u64
}

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Tracks frame cadence and round-trip latency.
#[derive(Debug, Default)]
pub struct TelemetryAggregator {
    last_frame: Option<Instant>,
    last_interval_ms: u64,
    exchanges: u64,
    round_trip_sum_ms: f64,
    last: Option<TelemetrySample>,
}

impl TelemetryAggregator {
    /// Creates an aggregator with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears history; frame intervals are measured from `now`.
    pub fn reset(&mut self, now: Instant) {
        *self = Self {
            last_frame: Some(now),
            ..Self::default()
        };
    }

    /// Records a completed frame and returns the buffering interval.
    pub fn frame_completed(&mut self, now: Instant) -> u64 {
        let interval = self
            .last_frame
            .map_or(0, |prev| now.saturating_duration_since(prev).as_millis() as u64);
        self.last_frame = Some(now);
        self.last_interval_ms = interval;
        interval
    }

    /// Records a successful exchange received at `now_ms` (epoch millis).
    pub fn exchange_completed(&mut self, envelope: &ResponseEnvelope, now_ms: i64) -> TelemetrySample {
        let total =
            now_ms.saturating_sub(envelope.sent_at_ms) as f64 + envelope.round_trip_extra_ms;
        let sample = self.sample(total, envelope.volume, envelope.perf);
        self.exchanges += 1;
        self.round_trip_sum_ms += total;
        self.last = Some(sample);
        sample
    }

    /// Builds a sample from server-pushed stats. Does not count as an exchange.
    pub fn server_stats(&self, volume: f64, perf: PerfVector) -> TelemetrySample {
        self.sample(0.0, volume, perf)
    }

    /// Returns the summary since the last reset.
    pub fn summary(&self) -> TelemetrySummary {
        let mean = if self.exchanges == 0 {
            0.0
        } else {
            self.round_trip_sum_ms / self.exchanges as f64
        };
        TelemetrySummary {
            exchanges: self.exchanges,
            mean_round_trip_ms: mean,
            last: self.last,
        }
    }

    fn sample(&self, total_round_trip_ms: f64, volume: f64, perf: PerfVector) -> TelemetrySample {
        TelemetrySample {
            buffering_interval_ms: self.last_interval_ms,
            total_round_trip_ms,
            volume,
            preprocess_ms: seconds_to_ceil_ms(perf.preprocess),
            main_ms: seconds_to_ceil_ms(perf.main),
            post_ms: seconds_to_ceil_ms(perf.postprocess),
        }
    }
}

/// Callback receiving the buffering interval in milliseconds.
pub type BufferingCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Callback receiving per-exchange telemetry.
pub type PerformanceCallback = Arc<dyn Fn(&TelemetrySample) + Send + Sync>;

/// Callback receiving failure notifications.
pub type ExceptionCallback = Arc<dyn Fn(&PipelineException) + Send + Sync>;

/// Capabilities a host registers to observe a pipeline.
///
/// Every callback is optional. Callbacks run on the tokio runtime and should
/// return quickly.
///
/// # Example
///
/// ```
/// use voice_stream::PipelineListener;
///
/// let listener = PipelineListener::new()
///     .on_performance(|sample| {
///         tracing::debug!(round_trip = sample.total_round_trip_ms, "exchange");
///     })
///     .on_exception(|e| tracing::warn!(code = %e.code, "{}", e.message));
/// ```
#[derive(Clone, Default)]
pub struct PipelineListener {
    buffering: Option<BufferingCallback>,
    performance: Option<PerformanceCallback>,
    exception: Option<ExceptionCallback>,
}

impl PipelineListener {
    /// Creates a listener with no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called each time a request frame completes.
    #[must_use]
    pub fn on_buffering_interval<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.buffering = Some(Arc::new(f));
        self
    }

    /// Called on every successful exchange and server stats push.
    #[must_use]
    pub fn on_performance<F>(mut self, f: F) -> Self
    where
        F: Fn(&TelemetrySample) + Send + Sync + 'static,
    {
        self.performance = Some(Arc::new(f));
        self
    }

    /// Called on every failed exchange.
    #[must_use]
    pub fn on_exception<F>(mut self, f: F) -> Self
    where
        F: Fn(&PipelineException) + Send + Sync + 'static,
    {
        self.exception = Some(Arc::new(f));
        self
    }

    pub(crate) fn buffering_interval(&self, ms: u64) {
        if let Some(ref callback) = self.buffering {
            callback(ms);
        }
    }

    pub(crate) fn performance(&self, sample: &TelemetrySample) {
        if let Some(ref callback) = self.performance {
            callback(sample);
        }
    }

    pub(crate) fn exception(&self, exception: &PipelineException) {
        if let Some(ref callback) = self.exception {
            callback(exception);
        }
    }
}

impl std::fmt::Debug for PipelineListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineListener")
            .field("buffering", &self.buffering.is_some())
            .field("performance", &self.performance.is_some())
            .field("exception", &self.exception.is_some())
            .finish()
    }
}
