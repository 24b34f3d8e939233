//! Capture of converted output.

/// Collects every decoded output buffer while armed.
#[derive(Debug, Default)]
pub struct Recorder {
    armed: bool,
    samples: Vec<f32>,
}

impl Recorder {
    /// Creates a disarmed recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears prior capture and starts recording.
    pub fn arm(&mut self) {
        self.samples.clear();
        self.armed = true;
    }

    /// Stops recording and returns everything captured, in arrival order.
    pub fn disarm(&mut self) -> Vec<f32> {
        self.armed = false;
        std::mem::take(&mut self.samples)
    }

    /// Appends `samples` if armed.
    pub fn capture(&mut self, samples: &[f32]) {
        if self.armed {
            self.samples.extend_from_slice(samples);
        }
    }

    /// Returns `true` while recording.
    pub fn is_armed(&self) -> bool {
        self.armed
    }
}
