//! Node Configuration
//!
//! Typed settings for both roles. Every struct deserializes from JSON with
//! `#[serde(default)]`, so a config file only needs the fields it overrides; the
//! defaults reproduce the fixed ports and file names of the deployed cluster.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::discovery::types::StorageNodeAddress;

pub const COORDINATOR_PORT: u16 = 6000;
pub const STORAGE_NODE_PORT: u16 = 5004;
pub const NODE_LIST_FILE: &str = "listServer.conf";
pub const MAPPING_FILE: &str = "file_mapping.conf";

/// Connect and I/O deadlines applied to every socket exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_timeout_ms: u64,
    /// Upper bound for one protocol step or one read/write inside a transfer.
    pub io_timeout_ms: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            io_timeout_ms: 30_000,
        }
    }
}

/// Coordinator side of the UDP discovery protocol.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub broadcast_addr: IpAddr,
    pub broadcast_ports: Vec<u16>,
    pub listen_host: IpAddr,
    pub response_ports: Vec<u16>,
    pub broadcast_interval_secs: u64,
}

impl DiscoveryConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            broadcast_ports: (6001..=6003).collect(),
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            response_ports: (6004..=6006).collect(),
            broadcast_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub bind_addr: SocketAddr,
    /// Directory holding the persisted files and per-transfer scratch space.
    pub work_dir: PathBuf,
    pub node_list_file: String,
    pub mapping_file: String,
    pub reset_node_list_on_start: bool,
    pub max_connections: usize,
    pub discovery: DiscoveryConfig,
    pub timeouts: TimeoutConfig,
}

impl CoordinatorConfig {
    pub fn node_list_path(&self) -> PathBuf {
        self.work_dir.join(&self.node_list_file)
    }

    pub fn mapping_path(&self) -> PathBuf {
        self.work_dir.join(&self.mapping_file)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.work_dir.join("scratch")
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), COORDINATOR_PORT),
            work_dir: PathBuf::from("."),
            node_list_file: NODE_LIST_FILE.to_string(),
            mapping_file: MAPPING_FILE.to_string(),
            reset_node_list_on_start: true,
            max_connections: 256,
            discovery: DiscoveryConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// How a storage node picks the peer that receives its replica of a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaPolicyKind {
    /// Always the first configured peer.
    #[default]
    Fixed,
    RoundRobin,
    Rendezvous,
    Random,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub policy: ReplicaPolicyKind,
    pub peers: Vec<StorageNodeAddress>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            policy: ReplicaPolicyKind::Fixed,
            peers: vec![StorageNodeAddress::new("127.0.0.1", 5003)],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageNodeConfig {
    pub bind_addr: SocketAddr,
    /// Host written into discovery responses and replication reports.
    pub advertise_host: String,
    pub storage_dir: PathBuf,
    /// UDP address where broadcast probes are received.
    pub discovery_addr: SocketAddr,
    /// Coordinator port that receives discovery responses.
    pub response_port: u16,
    pub coordinator_addr: StorageNodeAddress,
    pub max_connections: usize,
    pub replication: ReplicationConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for StorageNodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), STORAGE_NODE_PORT),
            advertise_host: "127.0.0.1".to_string(),
            storage_dir: PathBuf::from("storage"),
            discovery_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 6002),
            response_port: 6005,
            coordinator_addr: StorageNodeAddress::new("127.0.0.1", COORDINATOR_PORT),
            max_connections: 256,
            replication: ReplicationConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Loads a JSON config file, or the defaults when no path is given.
pub fn load_json<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_cluster_ports() {
        let coordinator = CoordinatorConfig::default();
        assert_eq!(coordinator.bind_addr.port(), 6000);
        assert_eq!(coordinator.discovery.broadcast_ports, vec![6001, 6002, 6003]);
        assert_eq!(coordinator.discovery.response_ports, vec![6004, 6005, 6006]);
        assert_eq!(coordinator.discovery.broadcast_interval(), Duration::from_secs(30));

        let node = StorageNodeConfig::default();
        assert_eq!(node.discovery_addr.port(), 6002);
        assert!(coordinator.discovery.response_ports.contains(&node.response_port));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "bind_addr": "127.0.0.1:7100",
            "replication": { "policy": "round_robin", "peers": ["10.0.0.2:5004", "10.0.0.3:5004"] }
        }"#;

        let config: StorageNodeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.bind_addr.port(), 7100);
        assert_eq!(config.replication.policy, ReplicaPolicyKind::RoundRobin);
        assert_eq!(config.replication.peers[1], StorageNodeAddress::new("10.0.0.3", 5004));
        assert_eq!(config.response_port, 6005);
        assert_eq!(config.timeouts.io(), Duration::from_secs(30));
    }

    #[test]
    fn test_bad_peer_address_is_rejected() {
        let json = r#"{ "replication": { "peers": ["no-port-here"] } }"#;
        assert!(serde_json::from_str::<StorageNodeConfig>(json).is_err());
    }

    #[test]
    fn test_load_json_without_path_uses_defaults() {
        let config: CoordinatorConfig = load_json(None).unwrap();
        assert_eq!(config.node_list_path(), PathBuf::from("./listServer.conf"));
    }
}
