//! Link-layer boundary: inbound notifications, outbound requests and the
//! [`LinkLayer`] sink the node submits requests through.

use tokio::sync::mpsc;

use credlink_protocol::{ChannelId, ChannelParams, ConnectResult, PeerId, RejectReason, ServiceId};

/// Events delivered by the link layer, one at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A peer asks to open a channel to `service`.
    ConnectRequest {
        peer: PeerId,
        channel: ChannelId,
        service: ServiceId,
        params: ChannelParams,
    },
    /// Answer to a locally initiated open.
    ConnectConfirm {
        peer: PeerId,
        channel: ChannelId,
        result: ConnectResult,
        params: ChannelParams,
    },
    /// The channel is gone, whichever side closed it.
    Disconnect { channel: ChannelId },
    /// A payload arrived. `length` is the SDU length reported by the stack;
    /// only the first `length` bytes of `data` are meaningful.
    DataArrived {
        channel: ChannelId,
        data: Vec<u8>,
        length: usize,
    },
    /// The stack reports the receive budget it holds for the peer is low.
    RxCreditLow { channel: ChannelId, credits: u16 },
    /// The peer granted transmit credits; `credits` is the new total.
    TxCreditUpdate { channel: ChannelId, credits: u16 },
    /// Transport availability for a peer's connection changed.
    TransportBusy { peer: PeerId, busy: bool },
    Timeout { code: u16 },
    HardwareFault { code: u16 },
    /// Any event code the manager does not know.
    Unknown { code: u16 },
}

impl Notification {
    /// Short name for log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectRequest { .. } => "connect_request",
            Self::ConnectConfirm { .. } => "connect_confirm",
            Self::Disconnect { .. } => "disconnect",
            Self::DataArrived { .. } => "data_arrived",
            Self::RxCreditLow { .. } => "rx_credit_low",
            Self::TxCreditUpdate { .. } => "tx_credit_update",
            Self::TransportBusy { .. } => "transport_busy",
            Self::Timeout { .. } => "timeout",
            Self::HardwareFault { .. } => "hardware_fault",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// Requests the manager issues to the link layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRequest {
    AcceptOpen {
        channel: ChannelId,
        params: ChannelParams,
    },
    RejectOpen {
        channel: ChannelId,
        reason: RejectReason,
    },
    SendData {
        channel: ChannelId,
        data: Vec<u8>,
    },
    GrantCredits {
        channel: ChannelId,
        credits: u16,
    },
    Connect {
        peer: PeerId,
        service: ServiceId,
        params: ChannelParams,
    },
    Disconnect {
        channel: ChannelId,
    },
}

impl LinkRequest {
    /// Channel the request addresses, if it addresses one.
    #[must_use]
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Self::AcceptOpen { channel, .. }
            | Self::RejectOpen { channel, .. }
            | Self::SendData { channel, .. }
            | Self::GrantCredits { channel, .. }
            | Self::Disconnect { channel } => Some(*channel),
            Self::Connect { .. } => None,
        }
    }
}

/// Link-layer failure surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFault {
    Hardware { code: u16 },
}

/// Failure to hand a request to the link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("link layer busy")]
    Busy,
    #[error("link layer closed")]
    Closed,
}

/// Sink for outbound requests.
///
/// `submit` must not block; a full or closed sink is reported as an error and
/// the request is dropped.
pub trait LinkLayer {
    fn submit(&mut self, request: LinkRequest) -> Result<(), LinkError>;
}

impl LinkLayer for mpsc::Sender<LinkRequest> {
    fn submit(&mut self, request: LinkRequest) -> Result<(), LinkError> {
        self.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkError::Busy,
            mpsc::error::TrySendError::Closed(_) => LinkError::Closed,
        })
    }
}

/// Records every request; used by tests and the simulator.
impl LinkLayer for Vec<LinkRequest> {
    fn submit(&mut self, request: LinkRequest) -> Result<(), LinkError> {
        self.push(request);
        Ok(())
    }
}
