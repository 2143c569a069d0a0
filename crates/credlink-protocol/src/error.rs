//! Protocol error types.
//!
//! These cover connection table bookkeeping, channel state transitions and
//! credit accounting. None of them are reported to the peer directly.

use crate::slot::SlotState;
use crate::types::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("no free connection slot (capacity {capacity})")]
    NoCapacity { capacity: usize },

    #[error("peer {0} already holds a connection slot")]
    PeerAlreadyConnected(PeerId),

    #[error("stale slot handle")]
    StaleHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: SlotState, to: SlotState },

    #[error("channel not open (state {0})")]
    NotOpen(SlotState),

    #[error("credit error: {0}")]
    Credit(#[from] CreditError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CreditError {
    #[error("insufficient transmit credit: need {needed}, have {available}")]
    Insufficient { needed: u16, available: u16 },
}
