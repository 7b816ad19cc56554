use crate::address::Address;
use crate::error::{QuireError, Result};
use crate::transport::{Endpoint, Endpoints};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity; a random one is drawn when absent.
    #[serde(default)]
    pub node_id: Option<Address>,
    pub listen: String,
    /// Endpoints other nodes should dial; defaults to `listen`.
    #[serde(default)]
    pub advertise: Vec<String>,
    #[serde(default)]
    pub storage: StorageConfig,
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub dock: DockConfig,
}

impl NodeConfig {
    pub fn advertised_endpoints(&self) -> Endpoints {
        if self.advertise.is_empty() {
            return [self.listen.as_str()].into_iter().collect();
        }
        self.advertise.iter().map(|addr| Endpoint::from(addr.as_str())).collect()
    }

    pub fn validate(&self) -> Result<()> {
        self.replication.validate()?;
        if self.listen.trim().is_empty() {
            return Err(QuireError::Config("listen address is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    Filesystem {
        path: PathBuf,
        #[serde(default)]
        capacity: Option<u64>,
    },
}

/// Replica placement and acknowledgement policy. Both values are required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub factor: usize,
    pub write_quorum: usize,
}

impl ReplicationConfig {
    pub fn new(factor: usize, write_quorum: usize) -> Result<Self> {
        let config = Self {
            factor,
            write_quorum,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.write_quorum == 0 || self.write_quorum > self.factor {
            return Err(QuireError::Config(format!(
                "write_quorum must be between 1 and factor ({}), got {}",
                self.factor, self.write_quorum
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OverlayConfig {
    Kouncil(KouncilConfig),
    Stonehenge { members: Vec<StonehengeMember> },
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig::Kouncil(KouncilConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StonehengeMember {
    pub id: Address,
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KouncilConfig {
    /// Seed endpoints contacted at startup.
    #[serde(default)]
    pub bootstrap: Vec<String>,
    #[serde(default = "default_watcher_interval_ms")]
    pub watcher_interval_ms: u64,
    /// Absolute ceiling between contact attempts with a disconnected peer.
    #[serde(default = "default_contact_ceiling_ms")]
    pub contact_ceiling_ms: u64,
    /// Maximum addresses per `kouncil_add_entries` push.
    #[serde(default = "default_broadcast_batch")]
    pub broadcast_batch: usize,
}

impl KouncilConfig {
    pub fn watcher_interval(&self) -> Duration {
        Duration::from_millis(self.watcher_interval_ms)
    }

    pub fn contact_ceiling(&self) -> Duration {
        Duration::from_millis(self.contact_ceiling_ms)
    }
}

impl Default for KouncilConfig {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            watcher_interval_ms: default_watcher_interval_ms(),
            contact_ceiling_ms: default_contact_ceiling_ms(),
            broadcast_batch: default_broadcast_batch(),
        }
    }
}

fn default_watcher_interval_ms() -> u64 {
    10_000
}

fn default_contact_ceiling_ms() -> u64 {
    60_000
}

fn default_broadcast_batch() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockConfig {
    /// Build a fresh remote peer on every request instead of reusing one.
    #[serde(default)]
    pub disable_peer_cache: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_backoff_start_ms")]
    pub backoff_start_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl DockConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn backoff_start(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for DockConfig {
    fn default() -> Self {
        Self {
            disable_peer_cache: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            backoff_start_ms: default_backoff_start_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_rpc_timeout_ms() -> u64 {
    30_000
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_backoff_start_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_requires_sane_quorum() {
        assert!(ReplicationConfig::new(3, 2).is_ok());
        assert!(ReplicationConfig::new(3, 0).is_err());
        assert!(ReplicationConfig::new(2, 3).is_err());
    }

    #[test]
    fn test_node_config_defaults() {
        let config: NodeConfig = serde_json::from_value(serde_json::json!({
            "listen": "127.0.0.1:7600",
            "replication": { "factor": 3, "write_quorum": 2 },
        }))
        .unwrap();

        config.validate().unwrap();
        assert!(config.node_id.is_none());
        assert_eq!(config.advertised_endpoints().to_string(), "[127.0.0.1:7600]");
        assert!(!config.dock.disable_peer_cache);
        match config.overlay {
            OverlayConfig::Kouncil(kouncil) => {
                assert_eq!(kouncil.watcher_interval(), Duration::from_secs(10));
                assert_eq!(kouncil.contact_ceiling(), Duration::from_secs(60));
            }
            other => panic!("unexpected overlay {:?}", other),
        }
    }

    #[test]
    fn test_replication_has_no_default() {
        let result: std::result::Result<NodeConfig, _> =
            serde_json::from_value(serde_json::json!({ "listen": "127.0.0.1:7600" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_storage_and_overlay_tags() {
        let storage: StorageConfig = serde_json::from_value(serde_json::json!({
            "backend": "filesystem", "path": "/var/lib/quire", "capacity": 1024
        }))
        .unwrap();
        assert!(matches!(storage, StorageConfig::Filesystem { capacity: Some(1024), .. }));

        let overlay: OverlayConfig = serde_json::from_value(serde_json::json!({
            "kind": "kouncil", "bootstrap": ["10.0.0.1:7600"]
        }))
        .unwrap();
        assert!(matches!(overlay, OverlayConfig::Kouncil(k) if k.bootstrap.len() == 1));
    }
}
