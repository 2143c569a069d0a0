//! Per-connection channel slot and its lifecycle.
//!
//! A [`Slot`] is pre-allocated storage for one peer connection. It is claimed
//! when an open request arrives, moves through the [`SlotState`] lifecycle, and
//! is reset to `Unconnected` when the channel closes.
//!
//! ```text
//! Unconnected ──claim──▶ ConnectPending ──accept──▶ Open ──teardown──▶ Closing
//!      ▲                       │                     │                    │
//!      └───────────────────────┴──────── release ────┴────────────────────┘
//! ```

use core::fmt;

use crate::credit::{CreditPolicy, CreditState, RxOutcome, segments_for};
use crate::error::ChannelError;
use crate::types::{ChannelId, ChannelParams, PeerId};

/// Lifecycle state of a connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Unconnected,
    ConnectPending,
    Open,
    Closing,
}

impl SlotState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconnected => "UNCONNECTED",
            Self::ConnectPending => "CONNECT_PENDING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
        }
    }

    /// Whether the slot is claimed by a peer.
    #[must_use]
    pub fn is_occupied(self) -> bool {
        !matches!(self, Self::Unconnected)
    }

    /// Whether `self -> to` is a legal edge of the lifecycle.
    ///
    /// Returning to `Unconnected` is only done through a release, which is
    /// legal from every state.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Unconnected, Self::ConnectPending)
                | (Self::ConnectPending, Self::Open)
                | (Self::ConnectPending, Self::Closing)
                | (Self::Open, Self::Closing)
                | (_, Self::Unconnected)
        )
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of an inbound payload that was cut down to the buffer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncation {
    pub channel: ChannelId,
    /// Length the peer sent.
    pub received: usize,
    /// Length kept in the slot.
    pub kept: usize,
}

/// Traffic counters for a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub rx_payloads: u64,
    pub tx_payloads: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub truncations: u64,
    /// Payloads overwritten before the relay could send them.
    pub overwritten: u64,
}

/// Channel state for one peer connection.
#[derive(Debug, Clone, Default)]
pub struct Slot {
    peer: Option<PeerId>,
    channel: Option<ChannelId>,
    state: SlotState,
    local_params: Option<ChannelParams>,
    peer_params: Option<ChannelParams>,
    credits: CreditState,
    pending: Vec<u8>,
    has_pending: bool,
    transport_busy: bool,
    stats: SlotStats,
}

impl Slot {
    // ------------------------------------------------------------------ //
    // Accessors
    // ------------------------------------------------------------------ //

    #[must_use]
    pub fn state(&self) -> SlotState {
        self.state
    }

    #[must_use]
    pub fn peer(&self) -> Option<PeerId> {
        self.peer
    }

    #[must_use]
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    #[must_use]
    pub fn local_params(&self) -> Option<ChannelParams> {
        self.local_params
    }

    #[must_use]
    pub fn peer_params(&self) -> Option<ChannelParams> {
        self.peer_params
    }

    #[must_use]
    pub fn credits(&self) -> &CreditState {
        &self.credits
    }

    pub fn credits_mut(&mut self) -> &mut CreditState {
        &mut self.credits
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.has_pending
    }

    /// The buffered payload, if one is waiting to be relayed.
    #[must_use]
    pub fn pending(&self) -> Option<&[u8]> {
        self.has_pending.then_some(self.pending.as_slice())
    }

    #[must_use]
    pub fn is_transport_busy(&self) -> bool {
        self.transport_busy
    }

    pub fn set_transport_busy(&mut self, busy: bool) {
        self.transport_busy = busy;
    }

    #[must_use]
    pub fn stats(&self) -> &SlotStats {
        &self.stats
    }

    // ------------------------------------------------------------------ //
    // Lifecycle
    // ------------------------------------------------------------------ //

    /// Move to `to`, refusing edges the lifecycle does not allow.
    pub fn transition(&mut self, to: SlotState) -> Result<(), ChannelError> {
        if !self.state.can_transition(to) {
            return Err(ChannelError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::trace!(
            peer = ?self.peer,
            from = %self.state,
            to = %to,
            "slot: transition"
        );
        self.state = to;
        Ok(())
    }

    /// Complete negotiation: record parameters, initialise credits and open.
    pub fn open(
        &mut self,
        channel: ChannelId,
        local: ChannelParams,
        peer: ChannelParams,
        policy: &CreditPolicy,
    ) -> Result<(), ChannelError> {
        self.transition(SlotState::Open)?;
        self.channel = Some(channel);
        self.local_params = Some(local);
        self.peer_params = Some(peer);
        self.credits = CreditState::open(policy, peer.credits);
        Ok(())
    }

    /// Begin a local teardown, dropping any payload not yet relayed.
    pub fn begin_close(&mut self) -> Result<(), ChannelError> {
        self.transition(SlotState::Closing)?;
        self.discard_pending();
        Ok(())
    }

    /// Reset to an unclaimed slot. Counters are cleared with everything else.
    pub(crate) fn reset(&mut self) {
        let mut buffer = core::mem::take(&mut self.pending);
        buffer.clear();
        *self = Self {
            pending: buffer,
            ..Self::default()
        };
    }

    /// Claim a free slot for `peer`. The table only calls this on
    /// `Unconnected` slots.
    pub(crate) fn claim(&mut self, peer: PeerId) {
        debug_assert_eq!(self.state, SlotState::Unconnected);
        self.state = SlotState::ConnectPending;
        self.peer = Some(peer);
    }

    // ------------------------------------------------------------------ //
    // Payload buffer
    // ------------------------------------------------------------------ //

    /// Buffer an inbound payload, truncating it to `max_len` bytes.
    ///
    /// Replaces any payload still waiting. Receive credits are charged for the
    /// full received length. Only legal while `Open`.
    pub fn buffer_payload(
        &mut self,
        data: &[u8],
        max_len: usize,
    ) -> Result<(RxOutcome, Option<Truncation>), ChannelError> {
        if self.state != SlotState::Open {
            return Err(ChannelError::NotOpen(self.state));
        }
        let mps = self.local_params.map_or(0, |p| p.mps);
        let outcome = self.credits.consume_rx(segments_for(data.len(), mps));

        let kept = data.len().min(max_len);
        if self.has_pending {
            self.stats.overwritten += 1;
        }
        self.pending.clear();
        self.pending.extend_from_slice(&data[..kept]);
        self.has_pending = true;

        self.stats.rx_payloads += 1;
        self.stats.rx_bytes += data.len() as u64;

        let truncation = (kept < data.len()).then(|| {
            self.stats.truncations += 1;
            Truncation {
                channel: self.channel.unwrap_or(ChannelId(0)),
                received: data.len(),
                kept,
            }
        });
        Ok((outcome, truncation))
    }

    /// Move the pending payload out for sending, spending transmit credits.
    ///
    /// Fails without mutation when the slot is not open or credit is short.
    pub fn take_for_send(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        if self.state != SlotState::Open {
            return Err(ChannelError::NotOpen(self.state));
        }
        if !self.has_pending {
            return Ok(None);
        }
        let cost = self.send_cost();
        self.credits.consume_tx(cost)?;
        let data = core::mem::take(&mut self.pending);
        self.has_pending = false;
        self.stats.tx_payloads += 1;
        self.stats.tx_bytes += data.len() as u64;
        Ok(Some(data))
    }

    /// Put back a payload taken by [`take_for_send`](Self::take_for_send)
    /// that the link layer refused, refunding its credits.
    ///
    /// When a newer payload arrived in the meantime only the credits come
    /// back and `false` is returned.
    pub fn restore_unsent(&mut self, data: Vec<u8>) -> Result<bool, ChannelError> {
        if self.state != SlotState::Open {
            return Err(ChannelError::NotOpen(self.state));
        }
        let mps = self.peer_params.map_or(0, |p| p.mps);
        self.credits.refund_tx(segments_for(data.len(), mps));
        self.stats.tx_payloads = self.stats.tx_payloads.saturating_sub(1);
        self.stats.tx_bytes = self.stats.tx_bytes.saturating_sub(data.len() as u64);
        if self.has_pending {
            return Ok(false);
        }
        self.pending = data;
        self.has_pending = true;
        Ok(true)
    }

    /// Transmit credits needed to send the pending payload.
    #[must_use]
    pub fn send_cost(&self) -> u16 {
        let mps = self.peer_params.map_or(0, |p| p.mps);
        segments_for(self.pending.len(), mps)
    }

    /// Whether the relay may send this slot's payload right now.
    #[must_use]
    pub fn is_ready_to_send(&self) -> bool {
        self.state == SlotState::Open
            && self.has_pending
            && !self.transport_busy
            && self.credits.can_send(self.send_cost())
    }

    fn discard_pending(&mut self) {
        if self.has_pending {
            tracing::debug!(
                channel = ?self.channel,
                len = self.pending.len(),
                "slot: discarding unsent payload"
            );
        }
        self.pending.clear();
        self.has_pending = false;
    }
}
