//! Protocol state for LE credit-based flow-controlled channels.
//!
//! This crate holds the I/O-free half of the channel manager: identifiers and
//! negotiated parameters, the fixed-capacity connection table, per-connection
//! slots, and the credit flow controller. Nothing here talks to a link layer;
//! callers act on the decisions it returns.

pub mod constants;
pub mod credit;
pub mod error;
pub mod slot;
pub mod table;
pub mod types;

pub use credit::{CreditPolicy, CreditState, RxOutcome, segments_for};
pub use error::{ChannelError, CreditError, TableError};
pub use slot::{Slot, SlotState, SlotStats, Truncation};
pub use table::{ConnectionTable, SlotHandle};
pub use types::{ChannelId, ChannelParams, ConnectResult, PeerId, RejectReason, ServiceId};
