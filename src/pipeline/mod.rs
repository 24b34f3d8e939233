//! Control-side pipeline tasks.
//!
//! ```text
//! AudioProcessor → event ring → Event Pump → frame queue → Exchanger → Transport
//!                                                              │
//!                     playback ◀── directive ring ◀── OutputRelay
//! ```
//!
//! - **Event Pump**: polls the event ring, resolves acks, queues frames
//! - **Exchanger**: runs exchanges, decodes replies, relays and records audio
//!
//! The rings ensure the audio callback never blocks on the network.

mod exchange;
mod pump;

pub(crate) use exchange::Exchanger;
pub(crate) use pump::{EventPump, QueuedFrame};
