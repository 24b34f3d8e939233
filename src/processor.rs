//! The audio-context half of a pipeline.
//!
//! [`AudioProcessor::process`] is called from the host's render callback. It
//! never blocks and never logs; everything it learns is reported through the
//! event ring or the shared counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ringbuf::traits::{Consumer, Producer};
use ringbuf::{HeapCons, HeapProd};

use crate::accumulator::FrameAccumulator;
use crate::boundary::{AudioEnds, Directive, ProcessorEvent};
use crate::frame::{RequestFrame, BLOCK_SIZE};

/// Acks that can wait for room in the event ring.
const PENDING_ACK_CAPACITY: usize = 4;

/// Counters written by the processor and read by the session.
#[derive(Debug, Default)]
pub(crate) struct ProcessorCounters {
    pub starts_handled: AtomicU64,
    pub frames_emitted: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub underrun_samples: AtomicU64,
    pub playback_overflows: AtomicU64,
    pub pool_misses: AtomicU64,
}

/// Drives frame accumulation and playback from the audio callback.
///
/// Obtained from [`PipelineBuilder::build()`](crate::PipelineBuilder::build)
/// and moved into the audio engine. The matching [`Session`](crate::Session)
/// controls it through directives.
pub struct AudioProcessor {
    name: Arc<str>,
    directives: HeapCons<Directive>,
    events: HeapProd<ProcessorEvent>,
    accumulator: FrameAccumulator,
    running: bool,
    staging: [f32; BLOCK_SIZE],
    staged: usize,
    playback: VecDeque<Vec<f32>>,
    playback_capacity: usize,
    playback_cursor: usize,
    pending_acks: VecDeque<ProcessorEvent>,
    counters: Arc<ProcessorCounters>,
}

impl AudioProcessor {
    pub(crate) fn new(
        name: &str,
        ends: AudioEnds,
        block_count: usize,
        playback_capacity: usize,
        counters: Arc<ProcessorCounters>,
    ) -> Self {
        let playback_capacity = playback_capacity.max(1);
        Self {
            name: Arc::from(name),
            directives: ends.directives,
            events: ends.events,
            accumulator: FrameAccumulator::new(block_count),
            running: false,
            staging: [0.0; BLOCK_SIZE],
            staged: 0,
            playback: VecDeque::with_capacity(playback_capacity),
            playback_capacity,
            playback_cursor: 0,
            pending_acks: VecDeque::with_capacity(PENDING_ACK_CAPACITY),
            counters,
        }
    }

    /// Name of the pipeline this processor belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` between `Start` and `Stop`.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Processes one render quantum.
    ///
    /// `input` is mono capture audio of any length; it is re-blocked into
    /// 128-sample blocks while running. `output` is filled from the playback
    /// queue, zero-filling whatever the queue cannot cover.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        self.drain_directives();
        self.flush_acks();

        if self.running {
            self.stage(input);
        }

        self.render(output);
    }

    fn drain_directives(&mut self) {
        while let Some(directive) = self.directives.try_pop() {
            match directive {
                Directive::Start { block_count } => {
                    self.counters.starts_handled.fetch_add(1, Ordering::SeqCst);
                    self.accumulator.configure(block_count);
                    self.staged = 0;
                    self.running = true;
                    self.queue_ack(ProcessorEvent::StartOk);
                }
                Directive::Stop => {
                    self.running = false;
                    self.discard_buffered();
                    self.queue_ack(ProcessorEvent::StopOk);
                }
                Directive::Configure { block_count } => {
                    self.accumulator.configure(block_count);
                    self.staged = 0;
                }
                Directive::TruncateBuffer => self.discard_buffered(),
                Directive::Voice(samples) => self.enqueue_voice(samples),
                Directive::Recycle(buf) => {
                    self.accumulator.recycle(buf);
                }
            }
        }
    }

    fn queue_ack(&mut self, ack: ProcessorEvent) {
        if self.pending_acks.len() < PENDING_ACK_CAPACITY {
            self.pending_acks.push_back(ack);
        }
    }

    fn flush_acks(&mut self) {
        while let Some(ack) = self.pending_acks.pop_front() {
            if let Err(ack) = self.events.try_push(ack) {
                self.pending_acks.push_front(ack);
                break;
            }
        }
    }

    fn discard_buffered(&mut self) {
        self.accumulator.reset();
        self.staged = 0;
        self.playback_cursor = 0;
        while let Some(buf) = self.playback.pop_front() {
            self.release(buf);
        }
    }

    fn enqueue_voice(&mut self, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        if self.playback.len() >= self.playback_capacity {
            if let Some(oldest) = self.playback.pop_front() {
                self.playback_cursor = 0;
                self.release(oldest);
            }
            self.counters
                .playback_overflows
                .fetch_add(1, Ordering::SeqCst);
        }
        self.playback.push_back(samples);
    }

    fn stage(&mut self, mut input: &[f32]) {
        while !input.is_empty() {
            let take = (BLOCK_SIZE - self.staged).min(input.len());
            self.staging[self.staged..self.staged + take].copy_from_slice(&input[..take]);
            self.staged += take;
            input = &input[take..];

            if self.staged == BLOCK_SIZE {
                self.staged = 0;
                if let Some(frame) = self.accumulator.push(&self.staging) {
                    self.emit_frame(frame);
                }
            }
        }
        self.counters
            .pool_misses
            .store(self.accumulator.pool_misses(), Ordering::SeqCst);
    }

    fn emit_frame(&mut self, frame: RequestFrame) {
        match self.events.try_push(ProcessorEvent::Frame(frame)) {
            Ok(()) => {
                self.counters.frames_emitted.fetch_add(1, Ordering::SeqCst);
            }
            Err(rejected) => {
                self.counters.frames_dropped.fetch_add(1, Ordering::SeqCst);
                if let ProcessorEvent::Frame(frame) = rejected {
                    self.accumulator.recycle(frame.into_samples());
                }
            }
        }
    }

    fn render(&mut self, output: &mut [f32]) {
        let mut written = 0;
        while written < output.len() {
            let Some(front) = self.playback.front() else {
                break;
            };
            let available = front.len() - self.playback_cursor;
            let take = available.min(output.len() - written);
            output[written..written + take]
                .copy_from_slice(&front[self.playback_cursor..self.playback_cursor + take]);
            written += take;
            self.playback_cursor += take;

            if self.playback_cursor == front.len() {
                self.playback_cursor = 0;
                if let Some(spent) = self.playback.pop_front() {
                    self.release(spent);
                }
            }
        }

        let missing = output.len() - written;
        if missing > 0 {
            output[written..].fill(0.0);
            if self.running {
                self.counters
                    .underrun_samples
                    .fetch_add(missing as u64, Ordering::SeqCst);
            }
        }
    }

    fn release(&mut self, buf: Vec<f32>) {
        // Dropped here only if the event ring is full.
        let _ = self.events.try_push(ProcessorEvent::Released(buf));
    }
}

impl std::fmt::Debug for AudioProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioProcessor")
            .field("name", &self.name)
            .field("running", &self.running)
            .field("block_count", &self.accumulator.block_count())
            .field("queued_buffers", &self.playback.len())
            .finish_non_exhaustive()
    }
}
