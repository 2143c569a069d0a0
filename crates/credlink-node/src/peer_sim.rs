//! Simulated link layer and remote routers.
//!
//! [`PeerRouter`] plays every remote peer at once: it opens channels, sends
//! seeded random payloads, checks each echo against what it sent and keeps
//! both credit budgets the way a real peer would. [`simulate`] wires it to a
//! running [`Node`] through the same queues a real link layer would use.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use credlink_protocol::{
    ChannelId, ChannelParams, ConnectResult, PeerId, ServiceId, segments_for,
};

use crate::config::{ChannelConfig, NodeConfig};
use crate::error::NodeError;
use crate::link::{LinkError, LinkRequest, Notification};
use crate::node::Node;

/// How long the simulator waits for the node before declaring a stall.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(5);

const FIRST_CHANNEL: u16 = 0x0040;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of remote routers.
    pub peers: u16,
    /// Payloads each router sends before closing.
    pub payloads: usize,
    pub seed: u64,
    /// Transmit credits each router grants the node.
    pub peer_credits: u16,
    pub peer_mps: u16,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            peers: 4,
            payloads: 16,
            seed: 42,
            peer_credits: 10,
            peer_mps: 247,
        }
    }
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimReport {
    pub opened: u64,
    pub rejected: u64,
    pub payloads_sent: u64,
    pub echoes_ok: u64,
    pub mismatches: u64,
    /// Requests the routers did not expect (echo with nothing outstanding,
    /// accept for an unknown channel, and so on).
    pub unexpected: u64,
    pub grants: u64,
    pub credits_granted: u64,
    pub tx_updates: u64,
    pub credit_low_reports: u64,
    pub closed: u64,
}

impl SimReport {
    /// Every echo matched and nothing unexpected was seen.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.mismatches == 0 && self.unexpected == 0 && self.echoes_ok == self.payloads_sent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Idle,
    Connecting,
    Open,
    Rejected,
    Closed,
}

#[derive(Debug)]
struct SimPeer {
    peer: PeerId,
    channel: ChannelId,
    state: PeerState,
    /// Segment size the node accepts from us.
    node_mps: u16,
    /// Credits we may still spend sending to the node.
    send_budget: u16,
    /// Credits the node may still spend sending to us.
    node_budget: u16,
    staged: Option<Vec<u8>>,
    outstanding: Option<Vec<u8>>,
    low_reported: bool,
    sent: usize,
}

/// The remote side of every channel.
#[derive(Debug)]
pub struct PeerRouter {
    rng: StdRng,
    peers: Vec<SimPeer>,
    payloads: usize,
    service: ServiceId,
    max_payload_len: usize,
    node_max_credits: u16,
    peer_params: ChannelParams,
    report: SimReport,
}

impl PeerRouter {
    pub fn new(channel: &ChannelConfig, sim: &SimConfig) -> Self {
        let max_segments = segments_for(channel.max_payload_len, sim.peer_mps);
        let peer_params = ChannelParams::new(
            channel.mtu,
            sim.peer_mps,
            sim.peer_credits.max(max_segments),
        );
        let peers = (0..sim.peers)
            .map(|i| SimPeer {
                peer: PeerId(i + 1),
                channel: ChannelId(FIRST_CHANNEL + i),
                state: PeerState::Idle,
                node_mps: 0,
                send_budget: 0,
                node_budget: 0,
                staged: None,
                outstanding: None,
                low_reported: false,
                sent: 0,
            })
            .collect();
        Self {
            rng: StdRng::seed_from_u64(sim.seed),
            peers,
            payloads: sim.payloads,
            service: channel.service(),
            max_payload_len: channel.max_payload_len,
            node_max_credits: channel.max_credits,
            peer_params,
            report: SimReport::default(),
        }
    }

    #[must_use]
    pub fn report(&self) -> &SimReport {
        &self.report
    }

    /// One open request per router.
    pub fn open_requests(&mut self) -> Vec<Notification> {
        let service = self.service;
        let params = self.peer_params;
        self.peers
            .iter_mut()
            .filter(|p| p.state == PeerState::Idle)
            .map(|p| {
                p.state = PeerState::Connecting;
                Notification::ConnectRequest {
                    peer: p.peer,
                    channel: p.channel,
                    service,
                    params,
                }
            })
            .collect()
    }

    /// Every router has either finished its payloads or given up.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.peers.iter().all(|p| match p.state {
            PeerState::Open => p.sent >= self.payloads && p.outstanding.is_none(),
            PeerState::Rejected | PeerState::Closed => true,
            PeerState::Idle | PeerState::Connecting => false,
        })
    }

    // ------------------------------------------------------------------ //
    // Outbound traffic
    // ------------------------------------------------------------------ //

    /// Send the next payload on every channel that has nothing outstanding.
    ///
    /// A router that cannot afford its next payload reports its receive
    /// budget as low instead.
    pub fn next_payloads(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        for i in 0..self.peers.len() {
            let ready = {
                let p = &self.peers[i];
                p.state == PeerState::Open && p.outstanding.is_none() && p.sent < self.payloads
            };
            if !ready {
                continue;
            }
            if self.peers[i].staged.is_none() {
                let payload = self.random_payload();
                self.peers[i].staged = Some(payload);
            }

            let p = &mut self.peers[i];
            let len = p.staged.as_ref().map_or(0, Vec::len);
            let cost = segments_for(len, p.node_mps);
            if p.send_budget < cost {
                if !p.low_reported {
                    p.low_reported = true;
                    self.report.credit_low_reports += 1;
                    out.push(Notification::RxCreditLow {
                        channel: p.channel,
                        credits: p.send_budget,
                    });
                }
                continue;
            }
            let Some(data) = p.staged.take() else {
                continue;
            };
            p.send_budget -= cost;
            p.outstanding = Some(data.clone());
            p.sent += 1;
            self.report.payloads_sent += 1;
            out.push(Notification::DataArrived {
                channel: p.channel,
                length: data.len(),
                data,
            });
        }
        out
    }

    /// Close every open channel from the router side.
    pub fn close_all(&mut self) -> Vec<Notification> {
        self.peers
            .iter_mut()
            .filter(|p| p.state == PeerState::Open)
            .map(|p| {
                p.state = PeerState::Closed;
                Notification::Disconnect { channel: p.channel }
            })
            .collect()
    }

    fn random_payload(&mut self) -> Vec<u8> {
        let len = self.rng.gen_range(1..=self.max_payload_len.max(1));
        let mut data = vec![0u8; len];
        self.rng.fill(&mut data[..]);
        data
    }

    // ------------------------------------------------------------------ //
    // Inbound requests
    // ------------------------------------------------------------------ //

    /// React to one request the node submitted.
    pub fn handle_request(&mut self, request: LinkRequest) -> Vec<Notification> {
        match request {
            LinkRequest::AcceptOpen { channel, params } => {
                let peer_credits = self.peer_params.credits;
                match find_peer(&mut self.peers, channel, PeerState::Connecting) {
                    Some(p) => {
                        p.state = PeerState::Open;
                        p.node_mps = params.mps;
                        p.send_budget = params.credits;
                        p.node_budget = peer_credits;
                        self.report.opened += 1;
                        tracing::debug!(%channel, "sim: channel open");
                    }
                    None => self.report.unexpected += 1,
                }
                Vec::new()
            }
            LinkRequest::RejectOpen { channel, reason } => {
                match find_peer(&mut self.peers, channel, PeerState::Connecting) {
                    Some(p) => {
                        p.state = PeerState::Rejected;
                        self.report.rejected += 1;
                        tracing::info!(%channel, %reason, "sim: open rejected");
                    }
                    None => self.report.unexpected += 1,
                }
                Vec::new()
            }
            LinkRequest::SendData { channel, data } => self.on_echo(channel, data),
            LinkRequest::GrantCredits { channel, credits } => {
                let limit = self.node_max_credits;
                match find_peer(&mut self.peers, channel, PeerState::Open) {
                    Some(p) => {
                        p.send_budget = p.send_budget.saturating_add(credits).min(limit);
                        p.low_reported = false;
                        self.report.grants += 1;
                        self.report.credits_granted += u64::from(credits);
                    }
                    None => self.report.unexpected += 1,
                }
                Vec::new()
            }
            LinkRequest::Disconnect { channel } => {
                match self.peers.iter_mut().find(|p| p.channel == channel) {
                    Some(p) => {
                        p.state = PeerState::Closed;
                        p.outstanding = None;
                        self.report.closed += 1;
                    }
                    None => self.report.unexpected += 1,
                }
                vec![Notification::Disconnect { channel }]
            }
            LinkRequest::Connect { peer, .. } => {
                // Routers never accept opens from the node.
                vec![Notification::ConnectConfirm {
                    peer,
                    channel: ChannelId(0),
                    result: ConnectResult::ServiceNotSupported,
                    params: self.peer_params,
                }]
            }
        }
    }

    fn on_echo(&mut self, channel: ChannelId, data: Vec<u8>) -> Vec<Notification> {
        let grant = self.peer_params.credits;
        let peer_mps = self.peer_params.mps;
        let max_segments = segments_for(self.max_payload_len, peer_mps);
        let Some(p) = find_peer(&mut self.peers, channel, PeerState::Open) else {
            self.report.unexpected += 1;
            return Vec::new();
        };
        let Some(expected) = p.outstanding.take() else {
            self.report.unexpected += 1;
            return Vec::new();
        };
        p.node_budget = p.node_budget.saturating_sub(segments_for(data.len(), peer_mps));
        let replenish = p.node_budget < max_segments;
        if replenish {
            p.node_budget = grant;
        }

        if expected == data {
            self.report.echoes_ok += 1;
        } else {
            self.report.mismatches += 1;
            tracing::warn!(
                %channel,
                expected = expected.len(),
                got = data.len(),
                "sim: echo mismatch"
            );
        }

        if replenish {
            self.report.tx_updates += 1;
            vec![Notification::TxCreditUpdate {
                channel,
                credits: grant,
            }]
        } else {
            Vec::new()
        }
    }
}

fn find_peer(peers: &mut [SimPeer], channel: ChannelId, state: PeerState) -> Option<&mut SimPeer> {
    peers
        .iter_mut()
        .find(|p| p.channel == channel && p.state == state)
}

/// Run a full simulation against a fresh node.
///
/// Opens every router's channel, exchanges `sim.payloads` payloads per
/// router, closes everything and returns the routers' report.
pub async fn simulate(config: &NodeConfig, sim: &SimConfig) -> Result<SimReport, NodeError> {
    let depth = config
        .node
        .queue_depth
        .max(usize::from(sim.peers).saturating_mul(4))
        .max(1);
    let (link_tx, mut link_rx) = mpsc::channel(depth);
    let (mut node, handle) = Node::new(config, link_tx);
    let task = tokio::spawn(async move { node.run().await.map(|()| node) });

    let mut router = PeerRouter::new(&config.channel, sim);
    tracing::info!(
        peers = sim.peers,
        payloads = sim.payloads,
        seed = sim.seed,
        "sim: starting"
    );
    for notification in router.open_requests() {
        handle.notify(notification).await?;
    }

    while !router.is_finished() {
        for notification in router.next_payloads() {
            handle.notify(notification).await?;
        }
        if router.is_finished() {
            break;
        }
        let request = tokio::time::timeout(STALL_TIMEOUT, link_rx.recv())
            .await
            .map_err(|_| NodeError::Stalled)?
            .ok_or(NodeError::Link(LinkError::Closed))?;
        for notification in router.handle_request(request) {
            handle.notify(notification).await?;
        }
    }

    for notification in router.close_all() {
        handle.notify(notification).await?;
    }
    // Closing the queue lets the node drain the disconnects and exit.
    drop(handle);
    let node = task.await??;

    let occupied = node.manager().table().occupied();
    if occupied > 0 {
        tracing::warn!(occupied, "sim: slots still occupied after close");
    }
    tracing::info!(
        echoes = router.report().echoes_ok,
        mismatches = router.report().mismatches,
        relayed = node.manager().relay().sent(),
        "sim: finished"
    );
    Ok(*router.report())
}
