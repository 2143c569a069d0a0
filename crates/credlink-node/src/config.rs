//! TOML-based configuration for the channel manager.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use credlink_protocol::constants::{
    DEFAULT_INITIAL_CREDITS, DEFAULT_LOW_WATER_MARK, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_CREDITS,
    DEFAULT_MAX_PAYLOAD_LEN, DEFAULT_MPS, DEFAULT_MTU,
};
use credlink_protocol::{ChannelParams, CreditPolicy, ServiceId, segments_for};

use crate::error::NodeError;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl NodeConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("failed to read config file: {e}")))?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, NodeError> {
        let config: Self =
            toml::from_str(s).map_err(|e| NodeError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), NodeError> {
        self.channel.validate()?;
        if self.node.queue_depth == 0 {
            return Err(NodeError::Config("queue_depth must be at least 1".into()));
        }
        if self.node.tick_interval_ms == 0 {
            return Err(NodeError::Config(
                "tick_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// The `[channel]` section: constants exposed to the surrounding application.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Service identifier accepted on incoming open requests.
    pub service_id: u16,
    /// Maximum simultaneous connections (table capacity).
    pub max_connections: usize,
    /// Maximum length of one relayed payload; longer payloads are truncated.
    pub max_payload_len: usize,
    pub mtu: u16,
    pub mps: u16,
    /// Receive credits granted to a peer when its channel opens.
    pub initial_credits: u16,
    /// Ceiling for both credit budgets.
    pub max_credits: u16,
    /// Receive budget below which credits are re-granted.
    pub low_water_mark: u16,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            service_id: ServiceId::IPSP.0,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            mtu: DEFAULT_MTU,
            mps: DEFAULT_MPS,
            initial_credits: DEFAULT_INITIAL_CREDITS,
            max_credits: DEFAULT_MAX_CREDITS,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
        }
    }
}

impl ChannelConfig {
    #[must_use]
    pub fn service(&self) -> ServiceId {
        ServiceId(self.service_id)
    }

    #[must_use]
    pub fn credit_policy(&self) -> CreditPolicy {
        CreditPolicy::new(self.initial_credits, self.max_credits, self.low_water_mark)
    }

    /// Parameters offered to peers when a channel opens.
    #[must_use]
    pub fn local_params(&self) -> ChannelParams {
        ChannelParams::new(self.mtu, self.mps, self.initial_credits)
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.max_connections == 0 {
            return Err(NodeError::Config(
                "max_connections must be at least 1".into(),
            ));
        }
        if !self.local_params().is_acceptable() {
            return Err(NodeError::Config(format!(
                "mtu {} / mps {} below the LE minimum",
                self.mtu, self.mps
            )));
        }
        if self.max_payload_len == 0 || self.max_payload_len > usize::from(self.mtu) {
            return Err(NodeError::Config(format!(
                "max_payload_len {} must be between 1 and mtu {}",
                self.max_payload_len, self.mtu
            )));
        }
        if self.initial_credits > self.max_credits {
            return Err(NodeError::Config(format!(
                "initial_credits {} exceeds max_credits {}",
                self.initial_credits, self.max_credits
            )));
        }
        if self.low_water_mark > self.max_credits {
            return Err(NodeError::Config(format!(
                "low_water_mark {} exceeds max_credits {}",
                self.low_water_mark, self.max_credits
            )));
        }
        let needed = segments_for(self.max_payload_len, self.mps);
        if self.max_credits < needed {
            return Err(NodeError::Config(format!(
                "max_credits {} cannot carry one {}-byte payload ({needed} segments)",
                self.max_credits, self.max_payload_len
            )));
        }
        Ok(())
    }
}

/// The `[node]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Depth of the bounded notification queue.
    pub queue_depth: usize,
    /// Interval between idle ticks in milliseconds.
    pub tick_interval_ms: u64,
}

impl NodeSection {
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            tick_interval_ms: 1000,
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// The `[logging]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
