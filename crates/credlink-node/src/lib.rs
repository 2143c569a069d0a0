//! Event-driven manager for credit-based, flow-controlled channels.
//!
//! This crate ties the protocol state in `credlink-protocol` to a link layer:
//! notifications are dispatched into the connection table, a round-robin relay
//! echoes buffered payloads back, and a tokio control loop drives both.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod link;
pub mod logging;
pub mod manager;
pub mod node;
pub mod peer_sim;
pub mod relay;

pub use config::NodeConfig;
pub use dispatch::{Dispatch, Dispatcher};
pub use error::NodeError;
pub use link::{LinkError, LinkFault, LinkLayer, LinkRequest, Notification};
pub use manager::ChannelManager;
pub use node::{Node, NodeHandle, NodeStats, ShutdownHandle};
pub use relay::RelayLoop;
