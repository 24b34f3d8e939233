//! Event pump - drains the processor's event ring on the control side.
//!
//! Polls at a fixed interval, the same way a capture bridge polls a ring
//! buffer fed by a CPAL callback:
//! - Acknowledgements resolve the pending lifecycle transition
//! - Frames are timestamped for telemetry and queued for the exchange task
//! - Released playback buffers are freed here, off the audio thread

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use ringbuf::traits::Consumer;
use ringbuf::HeapCons;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::boundary::ProcessorEvent;
use crate::frame::RequestFrame;
use crate::lifecycle::Ack;
use crate::session::SessionState;

/// A frame waiting for the transport, tagged with the generation it was
/// captured in.
#[derive(Debug)]
pub(crate) struct QueuedFrame {
    pub frame: RequestFrame,
    pub generation: u64,
}

pub(crate) struct EventPump {
    events: HeapCons<ProcessorEvent>,
    state: Arc<SessionState>,
    frame_tx: mpsc::Sender<QueuedFrame>,
    frames_queued: u64,
}

impl EventPump {
    pub fn new(
        events: HeapCons<ProcessorEvent>,
        state: Arc<SessionState>,
        frame_tx: mpsc::Sender<QueuedFrame>,
    ) -> Self {
        Self {
            events,
            state,
            frame_tx,
            frames_queued: 0,
        }
    }

    /// Runs until the session is closed.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.state.config.poll_interval);

        while !self.state.closed.load(Ordering::SeqCst) {
            interval.tick().await;
            while let Some(event) = self.events.try_pop() {
                self.handle(event);
            }
        }

        debug!(pipeline = %self.state.name, "Event pump terminated");
    }

    fn handle(&mut self, event: ProcessorEvent) {
        match event {
            ProcessorEvent::StartOk => self.acknowledge(Ack::Started),
            ProcessorEvent::StopOk => self.acknowledge(Ack::Stopped),
            ProcessorEvent::Frame(frame) => self.forward(frame),
            ProcessorEvent::Released(buf) => drop(buf),
        }
    }

    fn acknowledge(&self, ack: Ack) {
        if !self.state.lifecycle.lock().acknowledge(ack) {
            debug!(pipeline = %self.state.name, ?ack, "Ignoring stray acknowledgement");
        }
    }

    fn forward(&mut self, frame: RequestFrame) {
        if !self.state.is_running() || self.state.halted.load(Ordering::SeqCst) {
            self.state.drop_frame(frame);
            return;
        }

        let interval = self.state.telemetry.lock().frame_completed(Instant::now());
        self.state.listener.buffering_interval(interval);

        let queued = QueuedFrame {
            frame,
            generation: self.state.generation(),
        };
        match self.frame_tx.try_send(queued) {
            Ok(()) => {
                self.frames_queued += 1;
                if self.frames_queued % 50 == 0 {
                    debug!(
                        pipeline = %self.state.name,
                        frames = self.frames_queued,
                        interval_ms = interval,
                        "Frames queued for exchange"
                    );
                }
            }
            Err(TrySendError::Full(queued) | TrySendError::Closed(queued)) => {
                warn!(pipeline = %self.state.name, "Exchange queue full, dropping frame");
                self.state.drop_frame(queued.frame);
            }
        }
    }
}
