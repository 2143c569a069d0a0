//! End-to-end channel manager scenarios driven through notifications.

use credlink_node::config::ChannelConfig;
use credlink_node::{ChannelManager, LinkRequest, Notification};
use credlink_protocol::{
    ChannelId, ChannelParams, PeerId, RejectReason, ServiceId, SlotState,
};

const PEER_PARAMS: ChannelParams = ChannelParams::new(1280, 247, 10);

fn config() -> ChannelConfig {
    ChannelConfig {
        max_connections: 4,
        initial_credits: 10,
        max_credits: 10,
        low_water_mark: 0,
        ..ChannelConfig::default()
    }
}

fn open_request(peer: u16, channel: u16, service: ServiceId) -> Notification {
    Notification::ConnectRequest {
        peer: PeerId(peer),
        channel: ChannelId(channel),
        service,
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

fn open_all(manager: &mut ChannelManager, n: u16) {
    for i in 0..n {
        let out = manager.handle_notification(open_request(i + 1, 0x40 + i, ServiceId::IPSP));
        assert!(matches!(
            out.requests.as_slice(),
            [LinkRequest::AcceptOpen { .. }]
        ));
    }
}

fn sent_channel(request: Option<LinkRequest>) -> ChannelId {
    match request {
        Some(LinkRequest::SendData { channel, .. }) => channel,
        other => panic!("expected SendData, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Open negotiation
// ---------------------------------------------------------------------------

#[test]
fn wrong_service_is_rejected_without_a_slot() {
    let mut manager = ChannelManager::new(&config());
    let out = manager.handle_notification(open_request(1, 0x40, ServiceId(0x1234)));
    assert_eq!(
        out.requests,
        vec![LinkRequest::RejectOpen {
            channel: ChannelId(0x40),
            reason: RejectReason::ServiceNotSupported,
        }]
    );
    assert_eq!(manager.table().occupied(), 0);
}

#[test]
fn open_beyond_capacity_gets_no_resources() {
    let mut manager = ChannelManager::new(&config());
    open_all(&mut manager, 4);
    assert_eq!(manager.table().count_in(SlotState::Open), 4);

    let out = manager.handle_notification(open_request(9, 0x50, ServiceId::IPSP));
    assert_eq!(
        out.requests,
        vec![LinkRequest::RejectOpen {
            channel: ChannelId(0x50),
            reason: RejectReason::NoResources,
        }]
    );
    assert_eq!(manager.table().count_in(SlotState::Open), 4);
    assert!(manager.table().find_by_connection(PeerId(9)).is_none());
}

#[test]
fn same_peer_opening_twice_is_refused() {
    let mut manager = ChannelManager::new(&config());
    open_all(&mut manager, 1);
    let out = manager.handle_notification(open_request(1, 0x60, ServiceId::IPSP));
    assert_eq!(
        out.requests,
        vec![LinkRequest::RejectOpen {
            channel: ChannelId(0x60),
            reason: RejectReason::NoResources,
        }]
    );
    assert_eq!(manager.table().occupied(), 1);
}

// ---------------------------------------------------------------------------
// Credit flow
// ---------------------------------------------------------------------------

#[test]
fn sixth_payload_over_five_credits_triggers_full_regrant() {
    let mut manager = ChannelManager::new(&ChannelConfig {
        initial_credits: 5,
        max_credits: 5,
        low_water_mark: 0,
        max_payload_len: 64,
        ..config()
    });
    open_all(&mut manager, 1);

    for i in 0..5u8 {
        let out = manager.handle_notification(data(0x40, &[i]));
        assert!(out.requests.is_empty(), "arrival {i} should not re-grant");
    }
    let out = manager.handle_notification(data(0x40, &[5]));
    assert_eq!(
        out.requests,
        vec![LinkRequest::GrantCredits {
            channel: ChannelId(0x40),
            credits: 5,
        }]
    );
    // the over-budget payload is still relayed
    assert_eq!(
        manager.relay_pass(),
        Some(LinkRequest::SendData {
            channel: ChannelId(0x40),
            data: vec![5],
        })
    );
}

#[test]
fn peer_segment_size_must_fit_the_credit_ceiling() {
    // a full 1280-byte payload costs 6 segments at MPS 247 but 56 at MPS 23
    let mut manager = ChannelManager::new(&ChannelConfig {
        initial_credits: 6,
        max_credits: 6,
        low_water_mark: 0,
        ..config()
    });
    let out = manager.handle_notification(Notification::ConnectRequest {
        peer: PeerId(1),
        channel: ChannelId(0x40),
        service: ServiceId::IPSP,
        params: ChannelParams::new(1280, 23, 6),
    });
    assert_eq!(
        out.requests,
        vec![LinkRequest::RejectOpen {
            channel: ChannelId(0x40),
            reason: RejectReason::UnacceptableParameters,
        }]
    );
    assert_eq!(manager.table().occupied(), 0);

    manager.handle_notification(Notification::ConnectRequest {
        peer: PeerId(2),
        channel: ChannelId(0x41),
        service: ServiceId::IPSP,
        params: ChannelParams::new(1280, 247, 0),
    });
    let full = vec![0xA5; 1280];
    manager.handle_notification(data(0x41, &full));
    assert!(manager.relay_pass().is_none());
    manager.handle_notification(Notification::TxCreditUpdate {
        channel: ChannelId(0x41),
        credits: 1000,
    });
    assert_eq!(
        manager.relay_pass(),
        Some(LinkRequest::SendData {
            channel: ChannelId(0x41),
            data: full,
        })
    );
}

#[test]
fn zero_tx_credit_defers_until_update() {
    let mut manager = ChannelManager::new(&config());
    manager.handle_notification(Notification::ConnectRequest {
        peer: PeerId(1),
        channel: ChannelId(0x40),
        service: ServiceId::IPSP,
        params: ChannelParams::new(1280, 247, 0),
    });
    manager.handle_notification(data(0x40, b"hold"));
    assert!(manager.relay_pass().is_none());
    assert!(manager.relay_pass().is_none());

    manager.handle_notification(Notification::TxCreditUpdate {
        channel: ChannelId(0x40),
        credits: 3,
    });
    assert_eq!(
        manager.relay_pass(),
        Some(LinkRequest::SendData {
            channel: ChannelId(0x40),
            data: b"hold".to_vec(),
        })
    );
    let handle = manager.table().find_by_channel(ChannelId(0x40)).unwrap();
    assert_eq!(
        manager.table().get(handle).unwrap().credits().tx_remaining(),
        2
    );
    assert!(manager.relay_pass().is_none());
}

// ---------------------------------------------------------------------------
// Relay fairness
// ---------------------------------------------------------------------------

#[test]
fn every_ready_channel_serviced_once_in_m_passes() {
    let mut manager = ChannelManager::new(&config());
    open_all(&mut manager, 4);
    for i in 0..4u16 {
        manager.handle_notification(data(0x40 + i, &[i as u8; 8]));
    }

    let mut serviced: Vec<ChannelId> = (0..4).map(|_| sent_channel(manager.relay_pass())).collect();
    serviced.sort();
    assert_eq!(
        serviced,
        vec![ChannelId(0x40), ChannelId(0x41), ChannelId(0x42), ChannelId(0x43)]
    );
    assert!(manager.relay_pass().is_none());
}

#[test]
fn busy_channel_does_not_starve_others() {
    let mut manager = ChannelManager::new(&config());
    open_all(&mut manager, 3);
    manager.handle_notification(Notification::TransportBusy {
        peer: PeerId(1),
        busy: true,
    });
    for round in 0..3u8 {
        for i in 0..3u16 {
            manager.handle_notification(data(0x40 + i, &[round]));
        }
        assert_eq!(sent_channel(manager.relay_pass()), ChannelId(0x41));
        assert_eq!(sent_channel(manager.relay_pass()), ChannelId(0x42));
        assert!(manager.relay_pass().is_none());
    }
    manager.handle_notification(Notification::TransportBusy {
        peer: PeerId(1),
        busy: false,
    });
    assert_eq!(sent_channel(manager.relay_pass()), ChannelId(0x40));
}

#[test]
fn relayed_bytes_are_latest_payload_truncated() {
    let mut manager = ChannelManager::new(&ChannelConfig {
        max_payload_len: 16,
        ..config()
    });
    open_all(&mut manager, 1);
    manager.handle_notification(data(0x40, b"stale"));
    let long: Vec<u8> = (0..40).collect();
    let out = manager.handle_notification(data(0x40, &long));
    assert!(out.truncated.is_some());
    assert_eq!(
        manager.relay_pass(),
        Some(LinkRequest::SendData {
            channel: ChannelId(0x40),
            data: long[..16].to_vec(),
        })
    );
}

// ---------------------------------------------------------------------------
// Close
// ---------------------------------------------------------------------------

#[test]
fn disconnect_is_idempotent_and_later_data_is_ignored() {
    let mut manager = ChannelManager::new(&config());
    open_all(&mut manager, 2);
    manager.handle_notification(data(0x40, b"pending"));

    let close = Notification::Disconnect {
        channel: ChannelId(0x40),
    };
    assert!(manager.handle_notification(close.clone()).is_empty());
    assert!(manager.handle_notification(close).is_empty());
    assert_eq!(manager.table().occupied(), 1);

    assert!(manager.handle_notification(data(0x40, b"late")).is_empty());
    assert!(manager.relay_pass().is_none());
    assert!(manager.table().find_by_channel(ChannelId(0x40)).is_none());
    assert!(manager.table().find_by_channel(ChannelId(0x41)).is_some());
}

#[test]
fn freed_slot_accepts_new_peer() {
    let mut manager = ChannelManager::new(&config());
    open_all(&mut manager, 4);
    manager.handle_notification(Notification::Disconnect {
        channel: ChannelId(0x42),
    });
    let out = manager.handle_notification(open_request(7, 0x70, ServiceId::IPSP));
    assert!(matches!(
        out.requests.as_slice(),
        [LinkRequest::AcceptOpen { channel: ChannelId(0x70), .. }]
    ));
    assert_eq!(manager.table().count_in(SlotState::Open), 4);
}
