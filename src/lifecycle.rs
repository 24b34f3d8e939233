//! Start/stop state machine with one-shot acknowledgement tokens.

use std::fmt;

use tokio::sync::oneshot;

use crate::PipelineError;

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// Not streaming.
    #[default]
    Idle,
    /// `Start` posted, waiting for the audio engine.
    Starting,
    /// Streaming.
    Running,
    /// `Stop` posted, waiting for the audio engine.
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Acknowledgement received from the audio engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ack {
    Started,
    Stopped,
}

/// Outcome of a start or stop request.
#[derive(Debug)]
pub(crate) enum Transition {
    /// Already in the requested state; nothing to post.
    Complete,
    /// Directive must be posted; the receiver resolves on acknowledgement.
    Pending(oneshot::Receiver<()>),
}

/// Holds the current state and the pending acknowledgement token, if any.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    state: LifecycleState,
    pending: Option<oneshot::Sender<()>>,
    /// Acknowledgement of a timed-out transition whose directive is still
    /// queued for the audio engine.
    overdue: Option<Ack>,
}

impl Lifecycle {
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn request_start(&mut self) -> Result<Transition, PipelineError> {
        match self.state {
            LifecycleState::Running => Ok(Transition::Complete),
            LifecycleState::Idle => Ok(self.begin(LifecycleState::Starting)),
            state => Err(PipelineError::TransitionInProgress { state }),
        }
    }

    pub fn request_stop(&mut self) -> Result<Transition, PipelineError> {
        match self.state {
            LifecycleState::Idle => Ok(Transition::Complete),
            LifecycleState::Running => Ok(self.begin(LifecycleState::Stopping)),
            state => Err(PipelineError::TransitionInProgress { state }),
        }
    }

    fn begin(&mut self, state: LifecycleState) -> Transition {
        let (tx, rx) = oneshot::channel();
        self.state = state;
        self.pending = Some(tx);
        Transition::Pending(rx)
    }

    /// Resolves the pending token if `ack` matches the current transition.
    ///
    /// An overdue acknowledgement of a timed-out transition arriving while no
    /// transition is pending moves the state to what the audio engine applied.
    /// Returns `false` for stray acknowledgements.
    pub fn acknowledge(&mut self, ack: Ack) -> bool {
        let next = match (self.state, ack) {
            (LifecycleState::Starting, Ack::Started) => LifecycleState::Running,
            (LifecycleState::Stopping, Ack::Stopped) => LifecycleState::Idle,
            (LifecycleState::Idle | LifecycleState::Running, _) if self.overdue == Some(ack) => {
                self.overdue = None;
                self.state = match ack {
                    Ack::Started => LifecycleState::Running,
                    Ack::Stopped => LifecycleState::Idle,
                };
                return true;
            }
            _ => return false,
        };
        self.state = next;
        if let Some(tx) = self.pending.take() {
            let _ = tx.send(());
        }
        true
    }

    /// Rolls back a transition whose acknowledgement timed out.
    ///
    /// The directive is still queued, so its acknowledgement is remembered
    /// and applied if it arrives later.
    pub fn expire(&mut self) {
        self.overdue = match self.state {
            LifecycleState::Starting => Some(Ack::Started),
            LifecycleState::Stopping => Some(Ack::Stopped),
            _ => self.overdue,
        };
        self.abort();
    }

    /// Rolls back a transition whose directive was never delivered.
    pub fn abort(&mut self) {
        self.pending = None;
        self.state = match self.state {
            LifecycleState::Starting => LifecycleState::Idle,
            LifecycleState::Stopping => LifecycleState::Running,
            other => other,
        };
    }
}
