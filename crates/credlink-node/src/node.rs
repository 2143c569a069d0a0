//! Single-task control loop that owns the channel manager.
//!
//! Each iteration drains every queued notification and command, then runs
//! one relay pass. When the pass sent nothing the loop parks until the next
//! notification, command, tick or shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use credlink_protocol::{ChannelId, PeerId, ServiceId};

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::link::{LinkError, LinkFault, LinkLayer, LinkRequest, Notification};
use crate::manager::ChannelManager;

/// Locally initiated operations, sent through a [`NodeHandle`].
#[derive(Debug)]
pub enum Command {
    Connect {
        peer: PeerId,
        service: ServiceId,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    Teardown {
        channel: ChannelId,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    /// Give up on an outgoing open whose confirm never came.
    Abandon {
        peer: PeerId,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
}

/// Counters kept by the control loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub notifications: u64,
    pub requests: u64,
    pub submit_failures: u64,
    pub truncations: u64,
    pub faults: u64,
    pub idle_ticks: u64,
}

/// Cloneable trigger for stopping a running node.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Signal the node to stop after its current iteration.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Application side of a node: feeds notifications and commands in,
/// receives faults out.
#[derive(Debug)]
pub struct NodeHandle {
    notifications: mpsc::Sender<Notification>,
    commands: mpsc::Sender<Command>,
    /// Hardware faults reported by the link layer.
    pub faults: mpsc::Receiver<LinkFault>,
    shutdown: ShutdownHandle,
}

impl NodeHandle {
    /// Queue a notification, waiting while the queue is full.
    pub async fn notify(&self, notification: Notification) -> Result<(), NodeError> {
        self.notifications
            .send(notification)
            .await
            .map_err(|_| NodeError::Link(LinkError::Closed))
    }

    /// A sender the link layer can hold on to directly.
    #[must_use]
    pub fn notifier(&self) -> mpsc::Sender<Notification> {
        self.notifications.clone()
    }

    /// Open a channel to `peer`. Returns once the `Connect` request is issued.
    pub async fn connect(&self, peer: PeerId, service: ServiceId) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect {
            peer,
            service,
            reply,
        })
        .await?;
        rx.await.map_err(|_| NodeError::Link(LinkError::Closed))?
    }

    /// Close `channel`. Returns once the `Disconnect` request is issued.
    pub async fn teardown(&self, channel: ChannelId) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Teardown { channel, reply }).await?;
        rx.await.map_err(|_| NodeError::Link(LinkError::Closed))?
    }

    /// Release the slot held by an unconfirmed `connect` to `peer`.
    pub async fn abandon_connect(&self, peer: PeerId) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Abandon { peer, reply }).await?;
        rx.await.map_err(|_| NodeError::Link(LinkError::Closed))?
    }

    async fn command(&self, command: Command) -> Result<(), NodeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NodeError::Link(LinkError::Closed))
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }
}

struct Inbox {
    notifications: mpsc::Receiver<Notification>,
    commands: mpsc::Receiver<Command>,
}

/// Control loop owning a [`ChannelManager`] and the link-layer sink.
pub struct Node<L> {
    manager: ChannelManager,
    link: L,
    inbox: Option<Inbox>,
    fault_tx: mpsc::Sender<LinkFault>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    tick_interval: Duration,
    stats: NodeStats,
}

impl<L: LinkLayer> Node<L> {
    /// Create a node and the handle used to drive it.
    pub fn new(config: &NodeConfig, link: L) -> (Self, NodeHandle) {
        let depth = config.node.queue_depth.max(1);
        let (notify_tx, notify_rx) = mpsc::channel(depth);
        let (command_tx, command_rx) = mpsc::channel(depth);
        let (fault_tx, fault_rx) = mpsc::channel(depth);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let node = Self {
            manager: ChannelManager::new(&config.channel),
            link,
            inbox: Some(Inbox {
                notifications: notify_rx,
                commands: command_rx,
            }),
            fault_tx,
            shutdown_tx: Arc::clone(&shutdown_tx),
            shutdown_rx,
            tick_interval: config.node.tick_interval(),
            stats: NodeStats::default(),
        };
        let handle = NodeHandle {
            notifications: notify_tx,
            commands: command_tx,
            faults: fault_rx,
            shutdown: ShutdownHandle { tx: shutdown_tx },
        };
        (node, handle)
    }

    #[must_use]
    pub fn manager(&self) -> &ChannelManager {
        &self.manager
    }

    #[must_use]
    pub fn link(&self) -> &L {
        &self.link
    }

    #[must_use]
    pub fn stats(&self) -> NodeStats {
        self.stats
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Run until shutdown or until every notification sender is dropped.
    ///
    /// Can only be called once per node.
    pub async fn run(&mut self) -> Result<(), NodeError> {
        let Some(mut inbox) = self.inbox.take() else {
            return Err(NodeError::AlreadyRunning);
        };
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Don't fire immediately
        tick.tick().await;

        tracing::info!(
            capacity = self.manager.table().capacity(),
            "node: entering control loop"
        );

        loop {
            while let Ok(notification) = inbox.notifications.try_recv() {
                self.on_notification(notification);
            }
            while let Ok(command) = inbox.commands.try_recv() {
                self.on_command(command);
            }

            // A refused send stays buffered; wait for an event before retrying.
            let sent = match self.manager.relay_pass() {
                Some(request) => self.submit_relayed(request),
                None => false,
            };
            if sent {
                if *self.shutdown_rx.borrow() {
                    tracing::info!("node: shutdown signal received");
                    break;
                }
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    tracing::info!("node: shutdown signal received");
                    break;
                }

                notification = inbox.notifications.recv() => {
                    match notification {
                        Some(notification) => self.on_notification(notification),
                        None => {
                            tracing::info!("node: notification channel closed, exiting");
                            break;
                        }
                    }
                }

                Some(command) = inbox.commands.recv() => {
                    self.on_command(command);
                }

                _ = tick.tick() => {
                    self.on_tick();
                }
            }
        }

        tracing::info!(
            notifications = self.stats.notifications,
            requests = self.stats.requests,
            relayed = self.manager.relay().sent(),
            "node: control loop stopped"
        );
        Ok(())
    }

    fn on_notification(&mut self, notification: Notification) {
        self.stats.notifications += 1;
        let dispatch = self.manager.handle_notification(notification);
        for request in dispatch.requests {
            let accepted = match &request {
                LinkRequest::AcceptOpen { channel, .. } => Some(*channel),
                _ => None,
            };
            if let Err(e) = self.submit_checked(request) {
                tracing::warn!(error = %e, "node: request dropped");
                // The peer never saw the accept.
                if let Some(channel) = accepted {
                    let _ = self.manager.release_channel(channel);
                }
            }
        }
        if dispatch.truncated.is_some() {
            self.stats.truncations += 1;
        }
        if let Some(fault) = dispatch.fault {
            self.stats.faults += 1;
            if let Err(e) = self.fault_tx.try_send(fault) {
                tracing::warn!(error = %e, "node: fault not delivered");
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                peer,
                service,
                reply,
            } => {
                let result = match self.manager.connect(peer, service) {
                    Ok(request) => {
                        let submitted = self.submit_checked(request);
                        if submitted.is_err() {
                            let _ = self.manager.abandon_connect(peer);
                        }
                        submitted
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Teardown { channel, reply } => {
                let result = self
                    .manager
                    .teardown(channel)
                    .and_then(|request| self.submit_checked(request));
                let _ = reply.send(result);
            }
            Command::Abandon { peer, reply } => {
                let _ = reply.send(self.manager.abandon_connect(peer));
            }
        }
    }

    fn on_tick(&mut self) {
        if self.manager.is_idle() {
            self.stats.idle_ticks += 1;
            tracing::trace!("node: idle, low-power eligible");
        }
    }

    /// Submit a relayed send. On refusal the payload and its credits go
    /// back to the slot and `false` is returned.
    fn submit_relayed(&mut self, request: LinkRequest) -> bool {
        let unsent = match &request {
            LinkRequest::SendData { channel, data } => Some((*channel, data.clone())),
            _ => None,
        };
        let Err(e) = self.submit_checked(request) else {
            return true;
        };
        if let Some((channel, data)) = unsent {
            match self.manager.requeue(channel, data) {
                Ok(()) => tracing::debug!(%channel, error = %e, "node: send deferred"),
                Err(e) => tracing::warn!(%channel, error = %e, "node: unsent payload lost"),
            }
        }
        false
    }

    fn submit_checked(&mut self, request: LinkRequest) -> Result<(), NodeError> {
        let channel = request.channel();
        match self.link.submit(request) {
            Ok(()) => {
                self.stats.requests += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.submit_failures += 1;
                tracing::debug!(channel = ?channel, error = %e, "node: submit failed");
                Err(e.into())
            }
        }
    }
}
