//! Routing of decoded audio to the pipeline's own playback or a relay target.

use parking_lot::RwLock;

use crate::boundary::PlaybackPort;
use crate::PipelineError;

/// Sends each decoded buffer to exactly one playback queue.
///
/// The destination is resolved at dispatch time, so changing the target takes
/// effect on the next buffer.
#[derive(Debug)]
pub(crate) struct OutputRelay {
    own: PlaybackPort,
    target: RwLock<Option<PlaybackPort>>,
}

impl OutputRelay {
    pub fn new(own: PlaybackPort) -> Self {
        Self {
            own,
            target: RwLock::new(None),
        }
    }

    pub fn set_target(&self, target: Option<PlaybackPort>) {
        *self.target.write() = target;
    }

    pub fn is_active(&self) -> bool {
        self.target.read().is_some()
    }

    pub fn target_name(&self) -> Option<String> {
        self.target.read().as_ref().map(|p| p.name().to_string())
    }

    /// Moves `samples` into the current destination.
    pub fn dispatch(&self, samples: Vec<f32>) -> Result<(), PipelineError> {
        let target = self.target.read().clone();
        match target {
            Some(port) => port.inject(samples),
            None => self.own.inject(samples),
        }
    }
}
