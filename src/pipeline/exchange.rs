//! Exchange task - sends queued frames and routes the converted audio.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::pump::QueuedFrame;
use crate::session::SessionState;
use crate::telemetry::epoch_millis;
use crate::transport::Transport;
use crate::{ResponseEnvelope, TransportError};

pub(crate) struct Exchanger {
    state: Arc<SessionState>,
    frames: mpsc::Receiver<QueuedFrame>,
}

impl Exchanger {
    pub fn new(state: Arc<SessionState>, frames: mpsc::Receiver<QueuedFrame>) -> Self {
        Self { state, frames }
    }

    /// Runs until the event pump drops its sender.
    ///
    /// Serialized transports get one exchange at a time, abandoned when the
    /// generation changes or the transport is replaced. Concurrent transports
    /// get one task per frame.
    pub async fn run(mut self) {
        while let Some(queued) = self.frames.recv().await {
            let Some((transport, epoch)) = self.state.current_transport() else {
                self.state.drop_frame(queued.frame);
                continue;
            };
            if queued.generation != self.state.generation()
                || self.state.halted.load(Ordering::SeqCst)
            {
                self.state.drop_frame(queued.frame);
                continue;
            }

            if transport.concurrent() {
                let state = Arc::clone(&self.state);
                tokio::spawn(async move {
                    run_exchange(&state, transport.as_ref(), epoch, queued).await;
                });
            } else {
                let generation = queued.generation;
                let mut generations = self.state.generation.subscribe();
                let mut epochs = self.state.transport_epoch.subscribe();
                tokio::select! {
                    () = run_exchange(&self.state, transport.as_ref(), epoch, queued) => {}
                    _ = generations.wait_for(|g| *g != generation) => {
                        debug!(pipeline = %self.state.name, "Abandoning in-flight exchange");
                        self.state.late_responses.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = epochs.wait_for(|e| *e != epoch) => {
                        debug!(
                            pipeline = %self.state.name,
                            transport = transport.name(),
                            "Transport replaced, abandoning in-flight exchange"
                        );
                        self.state.late_responses.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }

        debug!(pipeline = %self.state.name, "Exchange task terminated");
    }
}

async fn run_exchange(
    state: &SessionState,
    transport: &dyn Transport,
    epoch: u64,
    queued: QueuedFrame,
) {
    let QueuedFrame { frame, generation } = queued;

    state.frames_sent.fetch_add(1, Ordering::SeqCst);
    let result = transport.exchange(&frame, epoch_millis()).await;
    state.recycle(frame);

    if generation != state.generation() {
        debug!(pipeline = %state.name, "Dropping late response");
        state.late_responses.fetch_add(1, Ordering::SeqCst);
        return;
    }
    if epoch != state.transport_epoch() {
        debug!(
            pipeline = %state.name,
            transport = transport.name(),
            "Dropping response from replaced transport"
        );
        state.late_responses.fetch_add(1, Ordering::SeqCst);
        return;
    }

    match result.and_then(|envelope| {
        let samples = envelope.decode()?;
        Ok((envelope, samples))
    }) {
        Ok((envelope, samples)) => deliver(state, &envelope, samples),
        Err(err) => report_failure(state, &err),
    }
}

fn deliver(state: &SessionState, envelope: &ResponseEnvelope, samples: Vec<f32>) {
    state.recorder.lock().capture(&samples);
    if let Err(e) = state.relay.dispatch(samples) {
        warn!(pipeline = %state.name, "Converted audio not queued: {e}");
    }

    let sample = state
        .telemetry
        .lock()
        .exchange_completed(envelope, epoch_millis());
    state.exchanges_completed.fetch_add(1, Ordering::SeqCst);
    state.listener.performance(&sample);
}

fn report_failure(state: &SessionState, err: &TransportError) {
    state.exchange_failures.fetch_add(1, Ordering::SeqCst);
    warn!(pipeline = %state.name, "Exchange failed: {err}");
    state.listener.exception(&err.to_exception());

    if err.is_fatal() {
        warn!(pipeline = %state.name, "Sending halted until reconfigured");
        state.halted.store(true, Ordering::SeqCst);
    }
    if matches!(err, TransportError::ResponseMismatch { .. }) {
        let _ = state.control.post(crate::boundary::Directive::TruncateBuffer);
    }
}
