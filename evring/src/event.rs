//! Event channels: a coalescing, maskable doorbell between two contexts.
//!
//! - [`EventTable`]: per-context pending/mask/binding bitmaps and the wake
//!   word a blocked context sleeps on.
//! - [`EventChannel`]: one party's handle on a connection's doorbell. It
//!   notifies a port in the *peer's* table and masks/consumes its own port
//!   in the *local* table.
//!
//! A notification carries no payload. Notifying an already pending channel
//! is a no-op, and masking suppresses delivery but not generation: a
//! notification made while masked is delivered on unmask.

mod channel;
mod table;

pub use channel::EventChannel;
pub use table::{ChannelState, Delivery, DeliveryGuard, EventTable, MAX_PORTS, Port};

use crate::host::HostError;

/// Errors produced by event channel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// The port is not bound in the table it was used against.
    #[error("{0} is not bound")]
    Unbound(Port),
    /// The port number is outside the table.
    #[error("{0} is out of range (max {max})", max = MAX_PORTS - 1)]
    OutOfRange(Port),
    /// The port number is already bound.
    #[error("{0} is already bound")]
    AlreadyBound(Port),
    /// No free port left in the table.
    #[error("all {max} ports are bound", max = MAX_PORTS)]
    Exhausted,
    /// The host failed to wake the notified context.
    #[error("host wake failed: {0}")]
    Host(#[from] HostError),
}

impl EventError {
    /// Whether this error means the peer broke the channel contract, rather
    /// than a local resource or host failure.
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Unbound(_) | Self::OutOfRange(_))
    }
}
