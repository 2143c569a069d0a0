//! Error types for the node.

use credlink_protocol::{ChannelError, TableError};

use crate::link::LinkError;

/// Errors that can occur while configuring or running a node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error("table error: {0}")]
    Table(#[from] TableError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("unknown channel: {0}")]
    UnknownChannel(credlink_protocol::ChannelId),
    #[error("node already running")]
    AlreadyRunning,
    #[error("node task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("no progress within the stall timeout")]
    Stalled,
}
