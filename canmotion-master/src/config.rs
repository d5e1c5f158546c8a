//! Master configuration
//!
//! A configuration can be loaded from TOML, or built in code:
//!
//! ```toml
//! node_id = 127
//! heartbeat_period_ms = 500
//! sdo_timeout_ms = 500
//!
//! [[node]]
//! node_id = 1
//! heartbeat_timeout_ms = 1500
//!
//! [[node.pdo]]
//! name = "controlword"
//! direction = "rx"
//! channel = 1
//! mode = "sync"
//! mappings = [ { index = 0x6040, sub = 0, size = 16 } ]
//!
//! [[node.pdo]]
//! name = "status"
//! direction = "tx"
//! channel = 1
//! mode = "async"
//! inhibit_time = 100
//! mappings = [
//!     { index = 0x6041, sub = 0, size = 16 },
//!     { index = 0x6064, sub = 0, size = 32 },
//! ]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use canmotion_common::{pdo::PdoMapping, NodeId};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::{
    error::{InvalidConfigSnafu, LocalError},
    pdo::{check_mappings, PdoChannel, PdoDirection, TransmissionMode},
};

/// Error returned when loading a [`MasterConfig`]
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The file could not be read
    #[snafu(display("Failed to read {}: {source}", path.display()))]
    Io {
        /// The path which was read
        path: PathBuf,
        /// The underlying error
        source: std::io::Error,
    },
    /// The TOML could not be parsed
    #[snafu(display("Failed to parse master config: {source}"))]
    Parse {
        /// The underlying error
        source: toml::de::Error,
    },
    /// The configuration parsed, but is not consistent
    #[snafu(display("Invalid master config: {message}"))]
    Invalid {
        /// What is wrong with it
        message: String,
    },
}

fn default_heartbeat_period_ms() -> u64 {
    500
}

fn default_sdo_timeout_ms() -> u64 {
    500
}

fn default_sdo_quiet_ms() -> u64 {
    250
}

fn default_nmt_timeout_ms() -> u64 {
    2000
}

fn default_receive_wait_ms() -> u64 {
    1000
}

fn default_pdo_settle_ms() -> u64 {
    100
}

fn default_event_capacity() -> usize {
    64
}

/// Configuration of the master and the nodes it manages
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    /// The master's own node ID, used for its heartbeat
    pub node_id: NodeId,
    /// Period of the master's heartbeat
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,
    /// How long to wait for an SDO response
    #[serde(default = "default_sdo_timeout_ms")]
    pub sdo_timeout_ms: u64,
    /// After an SDO timeout, how long the node's SDO channel is kept idle so a late response
    /// cannot answer the next request
    #[serde(default = "default_sdo_quiet_ms")]
    pub sdo_quiet_ms: u64,
    /// How long to wait for a node to confirm an NMT transition
    #[serde(default = "default_nmt_timeout_ms")]
    pub nmt_timeout_ms: u64,
    /// Upper bound on each wait of the dispatcher for a received frame
    #[serde(default = "default_receive_wait_ms")]
    pub receive_wait_ms: u64,
    /// Delay between clearing PDO mappings and writing new ones
    #[serde(default = "default_pdo_settle_ms")]
    pub pdo_settle_ms: u64,
    /// Number of events buffered for each subscriber before the oldest are dropped
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// The managed nodes
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeConfig>,
}

/// Configuration of one managed node
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// The node's ID
    pub node_id: NodeId,
    /// Heartbeat consumer timeout. When absent, the node is not monitored until
    /// [`Master::set_consumer`](crate::Master::set_consumer) is called.
    #[serde(default)]
    pub heartbeat_timeout_ms: Option<u64>,
    /// How long an SDO read value may be served from the cache. Values fed by an active TxPDO are
    /// always served from the cache.
    #[serde(default)]
    pub cache_max_age_ms: u64,
    /// PDO channels applied by [`NodeHandle::setup_pdos`](crate::NodeHandle::setup_pdos)
    #[serde(default, rename = "pdo")]
    pub pdos: Vec<PdoChannelConfig>,
}

/// Configuration of one named PDO channel
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdoChannelConfig {
    /// Name used by the application to refer to the channel
    pub name: String,
    /// Receive or transmit, from the node's point of view
    pub direction: PdoDirection,
    /// Channel number, 1..=4
    pub channel: u8,
    /// Transmission mode
    #[serde(default)]
    pub mode: TransmissionMode,
    /// Mapped objects, in frame order
    pub mappings: Vec<PdoMapping>,
    /// Inhibit time in units of 100us. Only for asynchronous transmit channels.
    #[serde(default)]
    pub inhibit_time: Option<u16>,
}

impl MasterConfig {
    /// Create a configuration with default timing and no nodes
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            heartbeat_period_ms: default_heartbeat_period_ms(),
            sdo_timeout_ms: default_sdo_timeout_ms(),
            sdo_quiet_ms: default_sdo_quiet_ms(),
            nmt_timeout_ms: default_nmt_timeout_ms(),
            receive_wait_ms: default_receive_wait_ms(),
            pdo_settle_ms: default_pdo_settle_ms(),
            event_capacity: default_event_capacity(),
            nodes: Vec::new(),
        }
    }

    /// Add a node
    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    /// Set the SDO response timeout
    pub fn with_sdo_timeout(mut self, timeout: Duration) -> Self {
        self.sdo_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set how long a node's SDO channel stays idle after a timeout
    pub fn with_sdo_quiet(mut self, quiet: Duration) -> Self {
        self.sdo_quiet_ms = quiet.as_millis() as u64;
        self
    }

    /// Set the NMT confirmation timeout
    pub fn with_nmt_timeout(mut self, timeout: Duration) -> Self {
        self.nmt_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the heartbeat producer period
    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period_ms = period.as_millis() as u64;
        self
    }

    /// Set the delay between clearing and writing PDO mappings
    pub fn with_pdo_settle(mut self, delay: Duration) -> Self {
        self.pdo_settle_ms = delay.as_millis() as u64;
        self
    }

    /// Parse a configuration from a TOML string and validate it
    pub fn load_from_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).context(ParseSnafu)?;
        if let Err(e) = config.validate() {
            let message = match e {
                LocalError::InvalidConfig { message } => message,
                other => other.to_string(),
            };
            return InvalidSnafu { message }.fail();
        }
        Ok(config)
    }

    /// Read a configuration from a TOML file and validate it
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).context(IoSnafu { path })?;
        Self::load_from_str(&s)
    }

    /// Check that the configuration is usable
    ///
    /// Rejects duplicate nodes, a node sharing the master's ID, zero periods or timeouts, and any
    /// invalid PDO channel.
    pub fn validate(&self) -> Result<(), LocalError> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.node_id == self.node_id {
                return InvalidConfigSnafu {
                    message: format!("node {} has the master's node ID", node.node_id),
                }
                .fail();
            }
            if !ids.insert(node.node_id) {
                return InvalidConfigSnafu {
                    message: format!("node {} is listed more than once", node.node_id),
                }
                .fail();
            }
            node.validate()?;
        }
        let nonzero = [
            ("heartbeat_period_ms", self.heartbeat_period_ms),
            ("sdo_timeout_ms", self.sdo_timeout_ms),
            ("nmt_timeout_ms", self.nmt_timeout_ms),
            ("receive_wait_ms", self.receive_wait_ms),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return InvalidConfigSnafu {
                message: format!("{name} must not be zero"),
            }
            .fail();
        }
        Ok(())
    }

    pub(crate) fn timing(&self) -> Timing {
        Timing {
            heartbeat_period: Duration::from_millis(self.heartbeat_period_ms),
            sdo_timeout: Duration::from_millis(self.sdo_timeout_ms),
            sdo_quiet: Duration::from_millis(self.sdo_quiet_ms),
            nmt_timeout: Duration::from_millis(self.nmt_timeout_ms),
            receive_wait: Duration::from_millis(self.receive_wait_ms),
            pdo_settle: Duration::from_millis(self.pdo_settle_ms),
        }
    }
}

impl NodeConfig {
    /// Create a node configuration with no heartbeat consumer and no PDOs
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            heartbeat_timeout_ms: None,
            cache_max_age_ms: 0,
            pdos: Vec::new(),
        }
    }

    /// Monitor the node's heartbeat with the given timeout
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Serve SDO reads from the cache while values are younger than `max_age`
    pub fn with_cache_max_age(mut self, max_age: Duration) -> Self {
        self.cache_max_age_ms = max_age.as_millis() as u64;
        self
    }

    /// Add a PDO channel
    pub fn with_pdo(mut self, pdo: PdoChannelConfig) -> Self {
        self.pdos.push(pdo);
        self
    }

    /// The heartbeat consumer timeout
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout_ms.map(Duration::from_millis)
    }

    /// The cache max age
    pub fn cache_max_age(&self) -> Duration {
        Duration::from_millis(self.cache_max_age_ms)
    }

    fn validate(&self) -> Result<(), LocalError> {
        let node = self.node_id;
        let mut names = HashSet::new();
        let mut channels = HashSet::new();
        for pdo in &self.pdos {
            let channel = pdo.pdo_channel()?;
            if !names.insert(pdo.name.as_str()) {
                return InvalidConfigSnafu {
                    message: format!("node {node}: PDO name {:?} is used twice", pdo.name),
                }
                .fail();
            }
            if !channels.insert(channel) {
                return InvalidConfigSnafu {
                    message: format!("node {node}: {channel} is configured twice"),
                }
                .fail();
            }
            if let Err(reason) = check_mappings(&pdo.mappings) {
                return InvalidConfigSnafu {
                    message: format!("node {node} {channel}: {reason}"),
                }
                .fail();
            }
            if pdo.inhibit_time.is_some()
                && (pdo.direction != PdoDirection::Tx || pdo.mode != TransmissionMode::Async)
            {
                return InvalidConfigSnafu {
                    message: format!(
                        "node {node} {channel}: inhibit time only applies to asynchronous transmit PDOs"
                    ),
                }
                .fail();
            }
        }
        Ok(())
    }
}

impl PdoChannelConfig {
    /// Create a channel configuration
    pub fn new(
        name: impl Into<String>,
        channel: PdoChannel,
        mode: TransmissionMode,
        mappings: Vec<PdoMapping>,
    ) -> Self {
        Self {
            name: name.into(),
            direction: channel.direction(),
            channel: channel.number(),
            mode,
            mappings,
            inhibit_time: None,
        }
    }

    /// Set the inhibit time, in units of 100us
    pub fn with_inhibit_time(mut self, inhibit_time: u16) -> Self {
        self.inhibit_time = Some(inhibit_time);
        self
    }

    /// The channel this configuration applies to
    pub fn pdo_channel(&self) -> Result<PdoChannel, LocalError> {
        PdoChannel::new(self.direction, self.channel).ok_or_else(|| {
            InvalidConfigSnafu {
                message: format!("PDO {:?}: channel {} is not in 1..=4", self.name, self.channel),
            }
            .build()
        })
    }
}

/// Timing parameters, converted from the configuration once
#[derive(Clone, Copy, Debug)]
pub(crate) struct Timing {
    pub heartbeat_period: Duration,
    pub sdo_timeout: Duration,
    pub sdo_quiet: Duration,
    pub nmt_timeout: Duration,
    pub receive_wait: Duration,
    pub pdo_settle: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertables::assert_contains;

    const CONFIG: &str = r#"
        node_id = 127
        heartbeat_period_ms = 250

        [[node]]
        node_id = 1
        heartbeat_timeout_ms = 1500

        [[node.pdo]]
        name = "controlword"
        direction = "rx"
        channel = 1
        mode = "sync"
        mappings = [ { index = 0x6040, sub = 0, size = 16 } ]

        [[node.pdo]]
        name = "status"
        direction = "tx"
        channel = 2
        inhibit_time = 100
        mappings = [
            { index = 0x6041, sub = 0, size = 16 },
            { index = 0x6064, sub = 0, size = 32 },
        ]

        [[node]]
        node_id = 2
    "#;

    #[test]
    fn test_load_from_str() {
        let cfg = MasterConfig::load_from_str(CONFIG).expect("Failed to parse config");
        assert_eq!(127, cfg.node_id.raw());
        assert_eq!(250, cfg.heartbeat_period_ms);
        assert_eq!(500, cfg.sdo_timeout_ms);
        assert_eq!(2, cfg.nodes.len());

        let node1 = &cfg.nodes[0];
        assert_eq!(Some(Duration::from_millis(1500)), node1.heartbeat_timeout());
        assert_eq!(2, node1.pdos.len());
        assert_eq!(PdoChannel::RX1, node1.pdos[0].pdo_channel().unwrap());
        assert_eq!(TransmissionMode::Sync, node1.pdos[0].mode);
        assert_eq!(TransmissionMode::Async, node1.pdos[1].mode);
        assert_eq!(Some(100), node1.pdos[1].inhibit_time);
        assert_eq!(
            PdoMapping {
                index: 0x6064,
                sub: 0,
                size: 32
            },
            node1.pdos[1].mappings[1]
        );
        assert_eq!(None, cfg.nodes[1].heartbeat_timeout());
    }

    #[test]
    fn test_builder_matches_toml() {
        let id = |n| NodeId::new(n).unwrap();
        let built = MasterConfig::new(id(127))
            .with_heartbeat_period(Duration::from_millis(250))
            .with_node(
                NodeConfig::new(id(1))
                    .with_heartbeat_timeout(Duration::from_millis(1500))
                    .with_pdo(PdoChannelConfig::new(
                        "controlword",
                        PdoChannel::RX1,
                        TransmissionMode::Sync,
                        vec![PdoMapping {
                            index: 0x6040,
                            sub: 0,
                            size: 16,
                        }],
                    ))
                    .with_pdo(
                        PdoChannelConfig::new(
                            "status",
                            PdoChannel::TX2,
                            TransmissionMode::Async,
                            vec![
                                PdoMapping {
                                    index: 0x6041,
                                    sub: 0,
                                    size: 16,
                                },
                                PdoMapping {
                                    index: 0x6064,
                                    sub: 0,
                                    size: 32,
                                },
                            ],
                        )
                        .with_inhibit_time(100),
                    ),
            )
            .with_node(NodeConfig::new(id(2)));
        assert_eq!(MasterConfig::load_from_str(CONFIG).unwrap(), built);
    }

    #[test]
    fn test_rejects_bad_configs() {
        let bad_node_id = "node_id = 0";
        assert!(matches!(
            MasterConfig::load_from_str(bad_node_id),
            Err(ConfigError::Parse { .. })
        ));

        let duplicate = r#"
            node_id = 127
            [[node]]
            node_id = 3
            [[node]]
            node_id = 3
        "#;
        let err = MasterConfig::load_from_str(duplicate).unwrap_err();
        assert_contains!(err.to_string(), "more than once");

        let bad_channel = r#"
            node_id = 127
            [[node]]
            node_id = 3
            [[node.pdo]]
            name = "x"
            direction = "rx"
            channel = 5
            mappings = []
        "#;
        let err = MasterConfig::load_from_str(bad_channel).unwrap_err();
        assert_contains!(err.to_string(), "not in 1..=4");

        let rx_inhibit = r#"
            node_id = 127
            [[node]]
            node_id = 3
            [[node.pdo]]
            name = "x"
            direction = "rx"
            channel = 1
            inhibit_time = 10
            mappings = []
        "#;
        let err = MasterConfig::load_from_str(rx_inhibit).unwrap_err();
        assert_contains!(err.to_string(), "inhibit time");

        let too_wide = r#"
            node_id = 127
            [[node]]
            node_id = 3
            [[node.pdo]]
            name = "x"
            direction = "tx"
            channel = 1
            mappings = [
                { index = 0x6064, sub = 0, size = 32 },
                { index = 0x606C, sub = 0, size = 32 },
                { index = 0x6041, sub = 0, size = 16 },
            ]
        "#;
        let err = MasterConfig::load_from_str(too_wide).unwrap_err();
        assert_contains!(err.to_string(), "mapped bits");
    }

    #[test]
    fn test_rejects_zero_timing() {
        for field in [
            "heartbeat_period_ms",
            "sdo_timeout_ms",
            "nmt_timeout_ms",
            "receive_wait_ms",
        ] {
            let config = format!("node_id = 127\n{field} = 0\n");
            let err = MasterConfig::load_from_str(&config).unwrap_err();
            assert_contains!(err.to_string(), field);
        }

        // A zero quiet period or settle delay is allowed
        let config = "node_id = 127\nsdo_quiet_ms = 0\npdo_settle_ms = 0\n";
        assert!(MasterConfig::load_from_str(config).is_ok());

        let built = MasterConfig::new(NodeId::new(127).unwrap()).with_sdo_timeout(Duration::ZERO);
        assert!(built.validate().is_err());
    }
}
