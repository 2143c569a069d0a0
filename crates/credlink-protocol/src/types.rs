//! Identifiers and negotiated channel parameters.

use core::fmt;

use crate::constants::{LE_MPS_MAX, LE_MPS_MIN, LE_MTU_MIN};

/// Opaque peer connection handle assigned by the link layer at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u16);

/// Local identifier of a flow-controlled channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u16);

/// Service multiplexer identifier carried by open requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub u16);

impl ServiceId {
    /// Internet Protocol Support Profile.
    pub const IPSP: Self = Self(0x0023);
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Parameters exchanged when a channel is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelParams {
    /// Largest SDU either side will accept.
    pub mtu: u16,
    /// Largest segment carried by one credit.
    pub mps: u16,
    /// Initial credit grant.
    pub credits: u16,
}

impl ChannelParams {
    pub const fn new(mtu: u16, mps: u16, credits: u16) -> Self {
        Self { mtu, mps, credits }
    }

    /// Whether the MTU and MPS satisfy the LE minimums.
    #[must_use]
    pub fn is_acceptable(&self) -> bool {
        self.mtu >= LE_MTU_MIN && (LE_MPS_MIN..=LE_MPS_MAX).contains(&self.mps)
    }
}

/// Result code of an open negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ConnectResult {
    Success = 0x0000,
    ServiceNotSupported = 0x0002,
    NoResources = 0x0004,
    UnacceptableParameters = 0x000B,
}

impl ConnectResult {
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Success),
            0x0002 => Some(Self::ServiceNotSupported),
            0x0004 => Some(Self::NoResources),
            0x000B => Some(Self::UnacceptableParameters),
            _ => None,
        }
    }

    /// The rejection reason, or `None` for [`ConnectResult::Success`].
    #[must_use]
    pub fn rejection(self) -> Option<RejectReason> {
        match self {
            Self::Success => None,
            Self::ServiceNotSupported => Some(RejectReason::ServiceNotSupported),
            Self::NoResources => Some(RejectReason::NoResources),
            Self::UnacceptableParameters => Some(RejectReason::UnacceptableParameters),
        }
    }
}

/// Why an open request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The request named a service this node does not serve.
    ServiceNotSupported,
    /// Every connection slot is occupied.
    NoResources,
    /// The requested MTU or MPS is below the LE minimum.
    UnacceptableParameters,
}

impl RejectReason {
    /// The result code reported to the peer.
    #[must_use]
    pub fn code(self) -> ConnectResult {
        match self {
            Self::ServiceNotSupported => ConnectResult::ServiceNotSupported,
            Self::NoResources => ConnectResult::NoResources,
            Self::UnacceptableParameters => ConnectResult::UnacceptableParameters,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ServiceNotSupported => "service not supported",
            Self::NoResources => "no resources",
            Self::UnacceptableParameters => "unacceptable parameters",
        };
        f.write_str(s)
    }
}
