//! Channel manager: the connection table plus the two actors that mutate it.
//!
//! This module is a pure state tracker. It does NOT submit anything to the
//! link layer; every operation returns the requests the caller must submit.

use credlink_protocol::{
    ChannelId, ConnectionTable, PeerId, ServiceId, SlotState, TableError,
};

use crate::config::ChannelConfig;
use crate::dispatch::{Dispatch, Dispatcher};
use crate::error::NodeError;
use crate::link::{LinkRequest, Notification};
use crate::relay::RelayLoop;

/// Owns the connection table and routes work to the dispatcher and relay.
#[derive(Debug, Clone)]
pub struct ChannelManager {
    table: ConnectionTable,
    dispatcher: Dispatcher,
    relay: RelayLoop,
}

impl ChannelManager {
    /// Create a manager with `config.max_connections` free slots.
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            table: ConnectionTable::with_capacity(config.max_connections),
            dispatcher: Dispatcher::new(config),
            relay: RelayLoop::new(),
        }
    }

    #[must_use]
    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    #[must_use]
    pub fn relay(&self) -> &RelayLoop {
        &self.relay
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    // ---- Event side ----

    /// Apply one link-layer notification.
    pub fn handle_notification(&mut self, notification: Notification) -> Dispatch {
        self.dispatcher.dispatch(&mut self.table, notification)
    }

    // ---- Relay side ----

    /// Run one relay pass; at most one `SendData` comes back.
    pub fn relay_pass(&mut self) -> Option<LinkRequest> {
        self.relay.pass(&mut self.table)
    }

    /// Whether any slot still holds a payload waiting to be echoed.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.table.iter().any(|(_, slot)| slot.has_pending())
    }

    /// Nothing open and nothing pending: the node may drop to low power.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.table.count_in(SlotState::Open) == 0 && !self.has_pending()
    }

    /// Hand a relayed payload the link layer refused back to its slot.
    ///
    /// Its transmit credits are refunded; the next eligible pass retries it.
    pub fn requeue(&mut self, channel: ChannelId, data: Vec<u8>) -> Result<(), NodeError> {
        let slot = self
            .table
            .find_by_channel(channel)
            .and_then(|handle| self.table.get_mut(handle))
            .ok_or(NodeError::UnknownChannel(channel))?;
        let len = data.len();
        let restored = slot.restore_unsent(data)?;
        self.relay.retract();
        if restored {
            tracing::debug!(%channel, len, "manager: unsent payload requeued");
        } else {
            tracing::debug!(%channel, len, "manager: unsent payload superseded");
        }
        Ok(())
    }

    // ---- Locally initiated lifecycle ----

    /// Start an outgoing open to `peer`.
    ///
    /// Claims a slot in `ConnectPending`; the slot opens (or is released) when
    /// the matching `ConnectConfirm` arrives.
    pub fn connect(&mut self, peer: PeerId, service: ServiceId) -> Result<LinkRequest, NodeError> {
        self.table.allocate(peer)?;
        let params = self.dispatcher.local_params();
        tracing::info!(%peer, %service, "manager: opening channel");
        Ok(LinkRequest::Connect {
            peer,
            service,
            params,
        })
    }

    /// Begin closing an open channel.
    ///
    /// The pending payload is dropped immediately. The slot stays in
    /// `Closing` until the link layer reports the disconnect.
    pub fn teardown(&mut self, channel: ChannelId) -> Result<LinkRequest, NodeError> {
        let slot = self
            .table
            .find_by_channel(channel)
            .and_then(|handle| self.table.get_mut(handle))
            .ok_or(NodeError::UnknownChannel(channel))?;
        slot.begin_close()?;
        tracing::info!(%channel, "manager: tearing down channel");
        Ok(LinkRequest::Disconnect { channel })
    }

    /// Release a channel's slot without asking the link layer.
    ///
    /// Used when an accept could not be delivered, so the peer never saw the
    /// channel open.
    pub fn release_channel(&mut self, channel: ChannelId) -> Result<(), NodeError> {
        let handle = self
            .table
            .find_by_channel(channel)
            .ok_or(NodeError::UnknownChannel(channel))?;
        self.table.release(handle)?;
        tracing::info!(%channel, "manager: channel released");
        Ok(())
    }

    /// Release every slot without talking to the link layer.
    ///
    /// Used after the link layer itself has gone away.
    pub fn reset(&mut self) -> usize {
        let handles: Vec<_> = self
            .table
            .iter()
            .filter(|(_, slot)| slot.state().is_occupied())
            .map(|(handle, _)| handle)
            .collect();
        let released = handles
            .into_iter()
            .filter(|&handle| self.table.release(handle).is_ok())
            .count();
        if released > 0 {
            tracing::info!(released, "manager: all channels released");
        }
        released
    }

    /// Release a slot claimed by `connect` that never got confirmed.
    pub fn abandon_connect(&mut self, peer: PeerId) -> Result<(), NodeError> {
        let handle = self
            .table
            .find_by_connection(peer)
            .filter(|&h| {
                self.table
                    .get(h)
                    .is_some_and(|slot| slot.state() == SlotState::ConnectPending)
            })
            .ok_or(TableError::StaleHandle)?;
        self.table.release(handle)?;
        tracing::info!(%peer, "manager: pending open abandoned");
        Ok(())
    }
}
