//! Node configuration.

use std::time::Duration;

use ouronet_protocol::{Endpoint, SessionConfig, VersionTable};
use serde::{Deserialize, Serialize};

/// Network magic of the Cardano mainnet.
pub const MAINNET_MAGIC: u64 = 764824073;

/// Network magic of the pre-production testnet.
pub const PREPROD_MAGIC: u64 = 1;

/// Network magic of the preview testnet.
pub const PREVIEW_MAGIC: u64 = 2;

/// Configuration for a client node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Network the peer must be on.
    pub network_magic: u64,
    /// Where the peer listens.
    pub endpoint: Endpoint,
    /// Speak the node-to-client protocol family (local socket, whole blocks).
    pub node_to_client: bool,
    /// Interval between keep-alive pings; `None` disables them.
    pub keep_alive_interval_ms: Option<u64>,
    /// Connection and retry behaviour.
    pub session: SessionConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network_magic: MAINNET_MAGIC,
            endpoint: Endpoint::tcp("127.0.0.1", 3001),
            node_to_client: false,
            keep_alive_interval_ms: Some(30_000),
            session: SessionConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(endpoint: Endpoint, network_magic: u64) -> Self {
        Self {
            endpoint,
            network_magic,
            ..Self::default()
        }
    }

    /// Node-to-client over a local socket.
    pub fn local(path: impl Into<std::path::PathBuf>, network_magic: u64) -> Self {
        Self {
            endpoint: Endpoint::unix(path),
            network_magic,
            node_to_client: true,
            keep_alive_interval_ms: None,
            ..Self::default()
        }
    }

    /// Versions proposed during the handshake.
    pub fn version_table(&self) -> VersionTable {
        if self.node_to_client {
            VersionTable::node_to_client(self.network_magic)
        } else {
            VersionTable::node_to_node(self.network_magic)
        }
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_mainnet_n2n() {
        let config = NodeConfig::default();
        assert_eq!(config.network_magic, MAINNET_MAGIC);
        assert!(!config.node_to_client);
        assert_eq!(config.version_table().versions(), (7..=14).collect::<Vec<_>>());
        assert_eq!(config.keep_alive_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_local_uses_n2c_versions() {
        let config = NodeConfig::local("/run/node.socket", PREPROD_MAGIC);
        assert!(config.node_to_client);
        assert!(config.version_table().versions().iter().all(|v| v & 0x8000 != 0));
        assert_eq!(config.keep_alive_interval(), None);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "network_magic": 2,
            "endpoint": {"type": "tcp", "host": "preview.example", "port": 3001},
            "keep_alive_interval_ms": 0,
            "session": {"auto_reconnect": false, "max_retries": 3}
        }"#;
        let config: NodeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.network_magic, PREVIEW_MAGIC);
        assert_eq!(config.endpoint, Endpoint::tcp("preview.example", 3001));
        assert_eq!(config.keep_alive_interval(), None);
        assert!(!config.session.auto_reconnect);
        assert_eq!(config.session.max_retries, Some(3));
    }
}
