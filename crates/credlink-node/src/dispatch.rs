//! Notification dispatch.
//!
//! [`Dispatcher::dispatch`] applies one link-layer notification to the
//! connection table and returns the requests the node should submit. It is a
//! pure state tracker: it never talks to the link layer itself and never
//! consumes a pending payload or transmit credit (that is the relay's job).

use credlink_protocol::{
    ChannelError, ChannelId, ChannelParams, ConnectResult, ConnectionTable, CreditPolicy, PeerId,
    RejectReason, RxOutcome, ServiceId, SlotState, Truncation, segments_for,
};

use crate::config::ChannelConfig;
use crate::link::{LinkFault, LinkRequest, Notification};

/// Everything that came out of handling one notification.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Requests to submit, in order.
    pub requests: Vec<LinkRequest>,
    /// A fault to surface to the application.
    pub fault: Option<LinkFault>,
    /// Set when an inbound payload was cut to the buffer size.
    pub truncated: Option<Truncation>,
}

impl Dispatch {
    fn request(request: LinkRequest) -> Self {
        Self {
            requests: vec![request],
            ..Self::default()
        }
    }

    /// Whether handling produced nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.fault.is_none() && self.truncated.is_none()
    }
}

/// Applies notifications to a [`ConnectionTable`].
#[derive(Debug, Clone)]
pub struct Dispatcher {
    service: ServiceId,
    local_params: ChannelParams,
    policy: CreditPolicy,
    max_payload_len: usize,
}

impl Dispatcher {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            service: config.service(),
            local_params: config.local_params(),
            policy: config.credit_policy(),
            max_payload_len: config.max_payload_len,
        }
    }

    #[must_use]
    pub fn service(&self) -> ServiceId {
        self.service
    }

    #[must_use]
    pub fn local_params(&self) -> ChannelParams {
        self.local_params
    }

    #[must_use]
    pub fn policy(&self) -> &CreditPolicy {
        &self.policy
    }

    /// Whether a full-size payload fits the transmit ceiling at the peer's MPS.
    ///
    /// A peer with a smaller MPS than ours makes every send cost more
    /// segments; a channel whose largest send exceeds `max_credits` could
    /// never relay it.
    #[must_use]
    pub fn fits_credit_limit(&self, params: &ChannelParams) -> bool {
        segments_for(self.max_payload_len, params.mps) <= self.policy.max_credits
    }

    /// Handle one notification.
    pub fn dispatch(&self, table: &mut ConnectionTable, notification: Notification) -> Dispatch {
        tracing::trace!(kind = notification.kind(), "dispatch: notification");
        match notification {
            Notification::ConnectRequest {
                peer,
                channel,
                service,
                params,
            } => self.on_connect_request(table, peer, channel, service, params),
            Notification::ConnectConfirm {
                peer,
                channel,
                result,
                params,
            } => self.on_connect_confirm(table, peer, channel, result, params),
            Notification::Disconnect { channel } => {
                on_disconnect(table, channel);
                Dispatch::default()
            }
            Notification::DataArrived {
                channel,
                data,
                length,
            } => self.on_data(table, channel, &data, length),
            Notification::RxCreditLow { channel, credits } => {
                on_rx_credit_low(table, channel, credits)
            }
            Notification::TxCreditUpdate { channel, credits } => {
                on_tx_credit_update(table, channel, credits);
                Dispatch::default()
            }
            Notification::TransportBusy { peer, busy } => {
                on_transport_busy(table, peer, busy);
                Dispatch::default()
            }
            Notification::Timeout { code } => {
                tracing::warn!(code, "dispatch: link-layer timeout");
                Dispatch::default()
            }
            Notification::HardwareFault { code } => {
                tracing::error!(code, "dispatch: hardware fault");
                Dispatch {
                    fault: Some(LinkFault::Hardware { code }),
                    ..Dispatch::default()
                }
            }
            Notification::Unknown { code } => {
                tracing::warn!(code, "dispatch: discarding unknown notification");
                Dispatch::default()
            }
        }
    }

    // ------------------------------------------------------------------ //
    // Open negotiation
    // ------------------------------------------------------------------ //

    fn on_connect_request(
        &self,
        table: &mut ConnectionTable,
        peer: PeerId,
        channel: ChannelId,
        service: ServiceId,
        params: ChannelParams,
    ) -> Dispatch {
        let reject = |reason: RejectReason| {
            tracing::warn!(%peer, %channel, %service, %reason, "dispatch: open rejected");
            Dispatch::request(LinkRequest::RejectOpen { channel, reason })
        };

        if service != self.service {
            return reject(RejectReason::ServiceNotSupported);
        }
        if !params.is_acceptable() {
            return reject(RejectReason::UnacceptableParameters);
        }
        if !self.fits_credit_limit(&params) {
            tracing::debug!(
                %peer,
                mps = params.mps,
                needed = segments_for(self.max_payload_len, params.mps),
                max_credits = self.policy.max_credits,
                "dispatch: peer MPS too small for credit ceiling"
            );
            return reject(RejectReason::UnacceptableParameters);
        }
        if table.find_by_channel(channel).is_some() {
            return reject(RejectReason::NoResources);
        }
        let handle = match table.allocate(peer) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "dispatch: no slot for open");
                return reject(RejectReason::NoResources);
            }
        };

        let opened = table
            .get_mut(handle)
            .ok_or(ChannelError::NotOpen(SlotState::Unconnected))
            .and_then(|slot| slot.open(channel, self.local_params, params, &self.policy));
        if let Err(e) = opened {
            tracing::warn!(%peer, %channel, error = %e, "dispatch: failed to open claimed slot");
            let _ = table.release(handle);
            return reject(RejectReason::NoResources);
        }

        tracing::info!(
            %peer,
            %channel,
            mtu = params.mtu,
            mps = params.mps,
            credits = params.credits,
            "dispatch: channel opened"
        );
        Dispatch::request(LinkRequest::AcceptOpen {
            channel,
            params: self.local_params,
        })
    }

    fn on_connect_confirm(
        &self,
        table: &mut ConnectionTable,
        peer: PeerId,
        channel: ChannelId,
        result: ConnectResult,
        params: ChannelParams,
    ) -> Dispatch {
        let Some(handle) = table.find_by_connection(peer) else {
            tracing::warn!(%peer, %channel, "dispatch: confirm for unknown peer discarded");
            return Dispatch::default();
        };
        let pending = table
            .get(handle)
            .is_some_and(|slot| slot.state() == SlotState::ConnectPending);
        if !pending {
            tracing::warn!(%peer, %channel, "dispatch: confirm for non-pending slot discarded");
            return Dispatch::default();
        }

        if let Some(reason) = result.rejection() {
            tracing::warn!(%peer, %reason, "dispatch: outgoing open refused");
            let _ = table.release(handle);
            return Dispatch::default();
        }
        if !params.is_acceptable() || !self.fits_credit_limit(&params) {
            tracing::warn!(
                %peer,
                %channel,
                mtu = params.mtu,
                mps = params.mps,
                "dispatch: peer confirmed with unacceptable parameters"
            );
            let _ = table.release(handle);
            return Dispatch::request(LinkRequest::Disconnect { channel });
        }

        let opened = table
            .get_mut(handle)
            .ok_or(ChannelError::NotOpen(SlotState::Unconnected))
            .and_then(|slot| slot.open(channel, self.local_params, params, &self.policy));
        match opened {
            Ok(()) => {
                tracing::info!(%peer, %channel, "dispatch: outgoing channel opened");
            }
            Err(e) => {
                tracing::warn!(%peer, %channel, error = %e, "dispatch: failed to open slot");
                let _ = table.release(handle);
            }
        }
        Dispatch::default()
    }

    // ------------------------------------------------------------------ //
    // Data
    // ------------------------------------------------------------------ //

    fn on_data(
        &self,
        table: &mut ConnectionTable,
        channel: ChannelId,
        data: &[u8],
        length: usize,
    ) -> Dispatch {
        let Some(payload) = data.get(..length) else {
            tracing::warn!(
                %channel,
                length,
                carried = data.len(),
                "dispatch: malformed data notification discarded"
            );
            return Dispatch::default();
        };
        let Some(slot) = table
            .find_by_channel(channel)
            .and_then(|handle| table.get_mut(handle))
        else {
            tracing::warn!(%channel, len = length, "dispatch: data for unknown channel discarded");
            return Dispatch::default();
        };

        let (outcome, truncated) = match slot.buffer_payload(payload, self.max_payload_len) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(%channel, error = %e, "dispatch: data discarded");
                return Dispatch::default();
            }
        };
        if let Some(t) = truncated {
            tracing::warn!(
                %channel,
                received = t.received,
                kept = t.kept,
                "dispatch: payload truncated"
            );
        }
        tracing::trace!(%channel, len = payload.len(), "dispatch: payload buffered");

        let mut dispatch = Dispatch {
            truncated,
            ..Dispatch::default()
        };
        let credits = slot.credits_mut();
        if outcome == RxOutcome::OverBudget || credits.needs_refill(self.policy.low_water_mark) {
            let grant = credits.refill();
            if grant > 0 {
                tracing::debug!(%channel, credits = grant, "dispatch: re-granting receive credits");
                dispatch
                    .requests
                    .push(LinkRequest::GrantCredits { channel, credits: grant });
            }
        }
        dispatch
    }
}

// ---------------------------------------------------------------------- //
// Stateless handlers
// ---------------------------------------------------------------------- //

fn on_disconnect(table: &mut ConnectionTable, channel: ChannelId) {
    let Some(handle) = table.find_by_channel(channel) else {
        tracing::debug!(%channel, "dispatch: disconnect for unknown channel ignored");
        return;
    };
    let state = table.get(handle).map(|slot| slot.state());
    if table.release(handle).is_ok() {
        tracing::info!(%channel, from = ?state, "dispatch: channel closed");
    }
}

fn on_rx_credit_low(table: &mut ConnectionTable, channel: ChannelId, credits: u16) -> Dispatch {
    let Some(slot) = table
        .find_by_channel(channel)
        .and_then(|handle| table.get_mut(handle))
        .filter(|slot| slot.state() == SlotState::Open)
    else {
        tracing::warn!(%channel, "dispatch: credit-low for channel not open ignored");
        return Dispatch::default();
    };
    let state = slot.credits_mut();
    state.set_rx(credits);
    let grant = state.refill();
    if grant == 0 {
        return Dispatch::default();
    }
    tracing::debug!(%channel, reported = credits, credits = grant, "dispatch: receive credits low");
    Dispatch::request(LinkRequest::GrantCredits {
        channel,
        credits: grant,
    })
}

fn on_tx_credit_update(table: &mut ConnectionTable, channel: ChannelId, credits: u16) {
    let Some(slot) = table
        .find_by_channel(channel)
        .and_then(|handle| table.get_mut(handle))
        .filter(|slot| slot.state() == SlotState::Open)
    else {
        tracing::warn!(%channel, credits, "dispatch: credit update for channel not open ignored");
        return;
    };
    if slot.credits_mut().set_tx(credits) {
        tracing::warn!(%channel, credits, "dispatch: transmit credits clamped to limit");
    }
}

fn on_transport_busy(table: &mut ConnectionTable, peer: PeerId, busy: bool) {
    let Some(slot) = table
        .find_by_connection(peer)
        .and_then(|handle| table.get_mut(handle))
    else {
        tracing::debug!(%peer, busy, "dispatch: busy status for unknown peer ignored");
        return;
    };
    slot.set_transport_busy(busy);
    tracing::trace!(%peer, busy, "dispatch: transport busy status");
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER_PARAMS: ChannelParams = ChannelParams::new(1280, 247, 10);

    fn config() -> ChannelConfig {
        ChannelConfig {
            max_connections: 2,
            initial_credits: 10,
            max_credits: 10,
            low_water_mark: 0,
            max_payload_len: 64,
            ..ChannelConfig::default()
        }
    }

    fn open_request(peer: u16, channel: u16) -> Notification {
        Notification::ConnectRequest {
            peer: PeerId(peer),
            channel: ChannelId(channel),
            service: ServiceId::IPSP,
            params: PEER_PARAMS,
        }
    }

    fn data(channel: u16, bytes: &[u8]) -> Notification {
        Notification::DataArrived {
            channel: ChannelId(channel),
            data: bytes.to_vec(),
            length: bytes.len(),
        }
    }

    #[test]
    fn accepted_open_answers_with_local_params() {
        let dispatcher = Dispatcher::new(&config());
        let mut table = ConnectionTable::with_capacity(2);
        let out = dispatcher.dispatch(&mut table, open_request(1, 0x40));
        assert_eq!(
            out.requests,
            vec![LinkRequest::AcceptOpen {
                channel: ChannelId(0x40),
                params: dispatcher.local_params(),
            }]
        );
        let handle = table.find_by_channel(ChannelId(0x40)).unwrap();
        let slot = table.get(handle).unwrap();
        assert_eq!(slot.state(), SlotState::Open);
        assert_eq!(slot.credits().tx_remaining(), 10);
        assert_eq!(slot.credits().rx_remaining(), 10);
    }

    #[test]
    fn duplicate_channel_is_rejected() {
        let dispatcher = Dispatcher::new(&config());
        let mut table = ConnectionTable::with_capacity(2);
        dispatcher.dispatch(&mut table, open_request(1, 0x40));
        let out = dispatcher.dispatch(&mut table, open_request(2, 0x40));
        assert_eq!(
            out.requests,
            vec![LinkRequest::RejectOpen {
                channel: ChannelId(0x40),
                reason: RejectReason::NoResources,
            }]
        );
        assert_eq!(table.occupied(), 1);
    }

    #[test]
    fn tiny_mps_is_unacceptable() {
        let dispatcher = Dispatcher::new(&config());
        let mut table = ConnectionTable::with_capacity(2);
        let out = dispatcher.dispatch(
            &mut table,
            Notification::ConnectRequest {
                peer: PeerId(1),
                channel: ChannelId(0x40),
                service: ServiceId::IPSP,
                params: ChannelParams::new(1280, 10, 5),
            },
        );
        assert_eq!(
            out.requests,
            vec![LinkRequest::RejectOpen {
                channel: ChannelId(0x40),
                reason: RejectReason::UnacceptableParameters,
            }]
        );
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn peer_mps_too_small_for_credit_ceiling_is_unacceptable() {
        // 64 bytes at MPS 23 cost 3 segments, more than the ceiling of 2
        let dispatcher = Dispatcher::new(&ChannelConfig {
            initial_credits: 2,
            max_credits: 2,
            ..config()
        });
        assert!(dispatcher.fits_credit_limit(&ChannelParams::new(1280, 66, 2)));
        assert!(!dispatcher.fits_credit_limit(&ChannelParams::new(1280, 23, 2)));

        let mut table = ConnectionTable::with_capacity(2);
        let out = dispatcher.dispatch(
            &mut table,
            Notification::ConnectRequest {
                peer: PeerId(1),
                channel: ChannelId(0x40),
                service: ServiceId::IPSP,
                params: ChannelParams::new(1280, 23, 2),
            },
        );
        assert_eq!(
            out.requests,
            vec![LinkRequest::RejectOpen {
                channel: ChannelId(0x40),
                reason: RejectReason::UnacceptableParameters,
            }]
        );
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn length_beyond_carried_bytes_is_malformed() {
        let dispatcher = Dispatcher::new(&config());
        let mut table = ConnectionTable::with_capacity(2);
        dispatcher.dispatch(&mut table, open_request(1, 0x40));
        let out = dispatcher.dispatch(
            &mut table,
            Notification::DataArrived {
                channel: ChannelId(0x40),
                data: vec![1, 2, 3],
                length: 4,
            },
        );
        assert!(out.is_empty());
        let handle = table.find_by_channel(ChannelId(0x40)).unwrap();
        assert!(!table.get(handle).unwrap().has_pending());
    }

    #[test]
    fn shorter_length_selects_prefix() {
        let dispatcher = Dispatcher::new(&config());
        let mut table = ConnectionTable::with_capacity(2);
        dispatcher.dispatch(&mut table, open_request(1, 0x40));
        dispatcher.dispatch(
            &mut table,
            Notification::DataArrived {
                channel: ChannelId(0x40),
                data: vec![1, 2, 3, 4],
                length: 2,
            },
        );
        let handle = table.find_by_channel(ChannelId(0x40)).unwrap();
        assert_eq!(table.get(handle).unwrap().pending(), Some(&[1u8, 2][..]));
    }

    #[test]
    fn oversize_data_reports_truncation() {
        let dispatcher = Dispatcher::new(&config());
        let mut table = ConnectionTable::with_capacity(2);
        dispatcher.dispatch(&mut table, open_request(1, 0x40));
        let out = dispatcher.dispatch(&mut table, data(0x40, &[7u8; 100]));
        assert_eq!(
            out.truncated,
            Some(Truncation {
                channel: ChannelId(0x40),
                received: 100,
                kept: 64,
            })
        );
    }

    #[test]
    fn rx_credit_low_tops_up_from_reported_count() {
        let dispatcher = Dispatcher::new(&config());
        let mut table = ConnectionTable::with_capacity(2);
        dispatcher.dispatch(&mut table, open_request(1, 0x40));
        let out = dispatcher.dispatch(
            &mut table,
            Notification::RxCreditLow {
                channel: ChannelId(0x40),
                credits: 3,
            },
        );
        assert_eq!(
            out.requests,
            vec![LinkRequest::GrantCredits {
                channel: ChannelId(0x40),
                credits: 7,
            }]
        );
    }

    #[test]
    fn low_water_crossing_regrants_without_notification() {
        let dispatcher = Dispatcher::new(&ChannelConfig {
            low_water_mark: 8,
            ..config()
        });
        let mut table = ConnectionTable::with_capacity(2);
        dispatcher.dispatch(&mut table, open_request(1, 0x40));
        assert!(dispatcher.dispatch(&mut table, data(0x40, b"a")).requests.is_empty());
        assert!(dispatcher.dispatch(&mut table, data(0x40, b"b")).requests.is_empty());
        let out = dispatcher.dispatch(&mut table, data(0x40, b"c"));
        assert_eq!(
            out.requests,
            vec![LinkRequest::GrantCredits {
                channel: ChannelId(0x40),
                credits: 3,
            }]
        );
    }

    #[test]
    fn transport_busy_tracks_peer() {
        let dispatcher = Dispatcher::new(&config());
        let mut table = ConnectionTable::with_capacity(2);
        dispatcher.dispatch(&mut table, open_request(1, 0x40));
        dispatcher.dispatch(
            &mut table,
            Notification::TransportBusy {
                peer: PeerId(1),
                busy: true,
            },
        );
        let handle = table.find_by_connection(PeerId(1)).unwrap();
        assert!(table.get(handle).unwrap().is_transport_busy());
    }

    #[test]
    fn hardware_fault_is_surfaced() {
        let dispatcher = Dispatcher::new(&config());
        let mut table = ConnectionTable::with_capacity(2);
        let out = dispatcher.dispatch(&mut table, Notification::HardwareFault { code: 3 });
        assert_eq!(out.fault, Some(LinkFault::Hardware { code: 3 }));
        assert!(out.requests.is_empty());
    }

    #[test]
    fn timeout_and_unknown_change_nothing() {
        let dispatcher = Dispatcher::new(&config());
        let mut table = ConnectionTable::with_capacity(2);
        dispatcher.dispatch(&mut table, open_request(1, 0x40));
        assert!(dispatcher.dispatch(&mut table, Notification::Timeout { code: 1 }).is_empty());
        assert!(dispatcher.dispatch(&mut table, Notification::Unknown { code: 0xFF }).is_empty());
        assert_eq!(table.count_in(SlotState::Open), 1);
    }

    // ================================================================== //
    // Outgoing open
    // ================================================================== //

    fn pending_outgoing(table: &mut ConnectionTable, peer: u16) {
        table.allocate(PeerId(peer)).unwrap();
    }

    #[test]
    fn confirm_success_opens_slot() {
        let dispatcher = Dispatcher::new(&config());
        let mut table = ConnectionTable::with_capacity(2);
        pending_outgoing(&mut table, 5);
        let out = dispatcher.dispatch(
            &mut table,
            Notification::ConnectConfirm {
                peer: PeerId(5),
                channel: ChannelId(0x41),
                result: ConnectResult::Success,
                params: ChannelParams::new(1280, 247, 4),
            },
        );
        assert!(out.requests.is_empty());
        let handle = table.find_by_channel(ChannelId(0x41)).unwrap();
        let slot = table.get(handle).unwrap();
        assert_eq!(slot.state(), SlotState::Open);
        assert_eq!(slot.credits().tx_remaining(), 4);
    }

    #[test]
    fn confirm_refusal_releases_slot() {
        let dispatcher = Dispatcher::new(&config());
        let mut table = ConnectionTable::with_capacity(2);
        pending_outgoing(&mut table, 5);
        dispatcher.dispatch(
            &mut table,
            Notification::ConnectConfirm {
                peer: PeerId(5),
                channel: ChannelId(0x41),
                result: ConnectResult::NoResources,
                params: PEER_PARAMS,
            },
        );
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn confirm_with_mps_too_small_disconnects() {
        let dispatcher = Dispatcher::new(&ChannelConfig {
            initial_credits: 2,
            max_credits: 2,
            ..config()
        });
        let mut table = ConnectionTable::with_capacity(2);
        pending_outgoing(&mut table, 5);
        let out = dispatcher.dispatch(
            &mut table,
            Notification::ConnectConfirm {
                peer: PeerId(5),
                channel: ChannelId(0x41),
                result: ConnectResult::Success,
                params: ChannelParams::new(1280, 23, 2),
            },
        );
        assert_eq!(
            out.requests,
            vec![LinkRequest::Disconnect {
                channel: ChannelId(0x41)
            }]
        );
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn confirm_for_open_slot_is_ignored() {
        let dispatcher = Dispatcher::new(&config());
        let mut table = ConnectionTable::with_capacity(2);
        dispatcher.dispatch(&mut table, open_request(1, 0x40));
        let out = dispatcher.dispatch(
            &mut table,
            Notification::ConnectConfirm {
                peer: PeerId(1),
                channel: ChannelId(0x55),
                result: ConnectResult::Success,
                params: PEER_PARAMS,
            },
        );
        assert!(out.is_empty());
        assert!(table.find_by_channel(ChannelId(0x40)).is_some());
        assert!(table.find_by_channel(ChannelId(0x55)).is_none());
    }
}
