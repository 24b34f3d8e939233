//! Message rings across the audio/control boundary.
//!
//! ```text
//! control (tokio) ──Directive──▶ AudioProcessor ──ProcessorEvent──▶ event pump
//! ```
//!
//! Both rings are lock-free SPSC. The directive producer is shared between
//! the session, the exchange task and relaying pipelines, so it sits behind a
//! mutex that only control-side code ever takes.

use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::traits::{Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::frame::RequestFrame;
use crate::PipelineError;

/// Command posted from the control side to the audio processor.
#[derive(Debug)]
pub enum Directive {
    /// Reallocate the accumulator and begin capturing.
    Start {
        /// Blocks per frame.
        block_count: usize,
    },
    /// Stop capturing and drop buffered audio.
    Stop,
    /// Reallocate the accumulator without changing run state.
    Configure {
        /// Blocks per frame.
        block_count: usize,
    },
    /// Drop queued playback audio and the partial request frame.
    TruncateBuffer,
    /// Decoded audio to queue for playback.
    Voice(Vec<f32>),
    /// A spent frame buffer to reuse.
    Recycle(Vec<i16>),
}

impl Directive {
    /// Short name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Stop => "stop",
            Self::Configure { .. } => "configure",
            Self::TruncateBuffer => "truncate_buffer",
            Self::Voice(_) => "voice",
            Self::Recycle(_) => "recycle",
        }
    }
}

/// Notification posted from the audio processor to the control side.
#[derive(Debug)]
pub enum ProcessorEvent {
    /// `Start` was applied.
    StartOk,
    /// `Stop` was applied.
    StopOk,
    /// A request frame is complete.
    Frame(RequestFrame),
    /// A playback buffer was fully rendered; its allocation is handed back
    /// so it is freed off the audio thread.
    Released(Vec<f32>),
}

/// Control-side handle for posting directives to one processor.
#[derive(Clone)]
pub(crate) struct ControlPort {
    name: Arc<str>,
    producer: Arc<Mutex<HeapProd<Directive>>>,
}

impl ControlPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post(&self, directive: Directive) -> Result<(), PipelineError> {
        self.producer
            .lock()
            .try_push(directive)
            .map_err(|rejected| PipelineError::DirectiveQueueFull {
                directive: rejected.name(),
            })
    }
}

impl std::fmt::Debug for ControlPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPort").field("name", &self.name).finish()
    }
}

/// Handle for injecting audio into a pipeline's playback queue.
///
/// Obtained from [`Session::playback_port()`](crate::Session::playback_port)
/// and passed to another session's
/// [`set_relay_target()`](crate::Session::set_relay_target).
#[derive(Clone, Debug)]
pub struct PlaybackPort {
    port: ControlPort,
}

impl PlaybackPort {
    pub(crate) fn new(port: ControlPort) -> Self {
        Self { port }
    }

    /// Name of the pipeline this port plays into.
    pub fn name(&self) -> &str {
        self.port.name()
    }

    /// Moves `samples` into the playback queue.
    ///
    /// # Errors
    ///
    /// Returns `DirectiveQueueFull` if the target processor is not draining
    /// its directives.
    pub fn inject(&self, samples: Vec<f32>) -> Result<(), PipelineError> {
        self.port.post(Directive::Voice(samples))
    }
}

/// Audio-side ends of the rings.
pub(crate) struct AudioEnds {
    pub directives: HeapCons<Directive>,
    pub events: HeapProd<ProcessorEvent>,
}

/// Creates both rings, returning the control port, the event consumer and
/// the audio-side ends.
pub(crate) fn channel(
    name: &str,
    directive_capacity: usize,
    event_capacity: usize,
) -> (ControlPort, HeapCons<ProcessorEvent>, AudioEnds) {
    let (dir_prod, dir_cons) = HeapRb::<Directive>::new(directive_capacity.max(1)).split();
    let (evt_prod, evt_cons) = HeapRb::<ProcessorEvent>::new(event_capacity.max(1)).split();

    let port = ControlPort {
        name: Arc::from(name),
        producer: Arc::new(Mutex::new(dir_prod)),
    };
    let audio = AudioEnds {
        directives: dir_cons,
        events: evt_prod,
    };
    (port, evt_cons, audio)
}
