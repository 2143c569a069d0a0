//! Credit-based flow control.
//!
//! Each direction of a channel carries its own credit budget. One credit
//! permits one segment of at most `mps` bytes; an SDU is split into
//! [`segments_for`] segments. [`CreditState`] tracks both budgets for a single
//! channel and produces decisions (refill amounts, send permission) that the
//! caller turns into link-layer requests.

use crate::constants::SDU_LENGTH_FIELD;
use crate::error::CreditError;

// ======================================================================== //
// Pure functions
// ======================================================================== //

/// Number of credits consumed by one SDU of `len` bytes over segments of
/// `mps` bytes.
///
/// The first segment carries the 2-byte SDU length, so the wire size is
/// `len + 2`. Always at least one credit. An `mps` of zero is treated as one
/// byte per segment.
pub fn segments_for(len: usize, mps: u16) -> u16 {
    let mps = usize::from(mps.max(1));
    let segments = (len + SDU_LENGTH_FIELD).div_ceil(mps).max(1);
    u16::try_from(segments).unwrap_or(u16::MAX)
}

/// Credits to grant so that `remaining` is topped back up to `limit`.
pub fn refill_amount(remaining: u16, limit: u16) -> u16 {
    limit.saturating_sub(remaining)
}

/// Whether the receive budget has dropped below the low-water mark.
pub fn below_low_water(remaining: u16, low_water_mark: u16) -> bool {
    remaining < low_water_mark
}

// ======================================================================== //
// CreditPolicy
// ======================================================================== //

/// Configured credit behaviour shared by every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditPolicy {
    /// Receive credits granted to the peer when a channel opens.
    pub initial_grant: u16,
    /// Ceiling for both budgets; refills top up to this value.
    pub max_credits: u16,
    /// Receive budget below which credits are re-granted proactively.
    pub low_water_mark: u16,
}

impl CreditPolicy {
    pub const fn new(initial_grant: u16, max_credits: u16, low_water_mark: u16) -> Self {
        Self {
            initial_grant,
            max_credits,
            low_water_mark,
        }
    }
}

/// Outcome of accounting for an inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// The payload fit in the remaining receive budget.
    Within,
    /// The peer sent more than we granted; the payload is still accepted.
    OverBudget,
}

// ======================================================================== //
// CreditState
// ======================================================================== //

/// Receive and transmit credit budgets for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreditState {
    rx_remaining: u16,
    tx_remaining: u16,
    limit: u16,
    over_budget: bool,
}

impl CreditState {
    /// Initialise both budgets for a freshly opened channel.
    ///
    /// `peer_grant` is the credit count the peer offered us in its open
    /// parameters. Both budgets are clamped to the policy maximum.
    pub fn open(policy: &CreditPolicy, peer_grant: u16) -> Self {
        let limit = policy.max_credits;
        let state = Self {
            rx_remaining: policy.initial_grant.min(limit),
            tx_remaining: peer_grant.min(limit),
            limit,
            over_budget: false,
        };
        tracing::debug!(
            rx = state.rx_remaining,
            tx = state.tx_remaining,
            limit,
            "credit: open"
        );
        state
    }

    #[must_use]
    pub fn rx_remaining(&self) -> u16 {
        self.rx_remaining
    }

    #[must_use]
    pub fn tx_remaining(&self) -> u16 {
        self.tx_remaining
    }

    #[must_use]
    pub fn limit(&self) -> u16 {
        self.limit
    }

    // ------------------------------------------------------------------ //
    // Receive direction
    // ------------------------------------------------------------------ //

    /// Account for an inbound payload spanning `segments` credits.
    pub fn consume_rx(&mut self, segments: u16) -> RxOutcome {
        if self.rx_remaining < segments {
            tracing::warn!(
                segments,
                rx = self.rx_remaining,
                "credit: peer sent beyond its receive budget"
            );
            self.rx_remaining = 0;
            self.over_budget = true;
            return RxOutcome::OverBudget;
        }
        self.rx_remaining -= segments;
        RxOutcome::Within
    }

    /// Whether receive credits should be re-granted now.
    #[must_use]
    pub fn needs_refill(&self, low_water_mark: u16) -> bool {
        self.over_budget || below_low_water(self.rx_remaining, low_water_mark)
    }

    /// Adopt the receive count reported by the link layer.
    pub fn set_rx(&mut self, credits: u16) {
        self.rx_remaining = credits.min(self.limit);
    }

    /// Top the receive budget back up to the limit and return the grant size.
    ///
    /// Returns 0 when the budget is already full.
    pub fn refill(&mut self) -> u16 {
        let grant = refill_amount(self.rx_remaining, self.limit);
        self.rx_remaining = self.limit;
        self.over_budget = false;
        if grant > 0 {
            tracing::debug!(grant, rx = self.rx_remaining, "credit: receive refill");
        }
        grant
    }

    // ------------------------------------------------------------------ //
    // Transmit direction
    // ------------------------------------------------------------------ //

    /// Whether `segments` credits are available for an outbound send.
    #[must_use]
    pub fn can_send(&self, segments: u16) -> bool {
        segments > 0 && self.tx_remaining >= segments
    }

    /// Spend `segments` transmit credits.
    pub fn consume_tx(&mut self, segments: u16) -> Result<(), CreditError> {
        if !self.can_send(segments) {
            return Err(CreditError::Insufficient {
                needed: segments,
                available: self.tx_remaining,
            });
        }
        self.tx_remaining -= segments;
        tracing::trace!(segments, tx = self.tx_remaining, "credit: transmit spent");
        Ok(())
    }

    /// Give back credits spent on a send the link layer never took.
    pub fn refund_tx(&mut self, segments: u16) {
        self.tx_remaining = self.tx_remaining.saturating_add(segments).min(self.limit);
        tracing::trace!(segments, tx = self.tx_remaining, "credit: transmit refunded");
    }

    /// Apply a transmit credit count reported by the link layer.
    ///
    /// Returns `true` when the reported value exceeded the limit and was
    /// clamped.
    pub fn set_tx(&mut self, credits: u16) -> bool {
        let clamped = credits > self.limit;
        self.tx_remaining = credits.min(self.limit);
        tracing::debug!(
            reported = credits,
            tx = self.tx_remaining,
            clamped,
            "credit: transmit update"
        );
        clamped
    }
}
