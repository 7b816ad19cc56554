use crate::address::Address;
use crate::config::{NodeConfig, OverlayConfig, StorageConfig};
use crate::consensus::{Consensus, QuorumConsensus};
use crate::crypto::KeyPair;
use crate::dock::{Dock, NodeLocation};
use crate::doughnut::Doughnut;
use crate::error::Result;
use crate::overlay::{Kouncil, KouncilStats, Overlay, Stonehenge};
use crate::peer::LocalPeer;
use crate::storage::{FilesystemStorage, MemoryStorage, Storage};
use crate::transport::{Endpoint, Endpoints, HttpTransport, Service, Transport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Assembles a [`Node`] from a [`NodeConfig`]. Keys, transport and
/// storage can be supplied directly; otherwise they are derived from the
/// configuration.
pub struct NodeBuilder {
    config: NodeConfig,
    keys: Option<Arc<KeyPair>>,
    transport: Option<Arc<dyn Transport>>,
    storage: Option<Arc<dyn Storage>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            keys: None,
            transport: None,
            storage: None,
        }
    }

    pub fn keys(mut self, keys: Arc<KeyPair>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub async fn build(self) -> Result<Node> {
        let config = self.config;
        config.validate()?;

        let id = config.node_id.unwrap_or_else(Address::random);
        let endpoints = config.advertised_endpoints();

        let storage: Arc<dyn Storage> = match self.storage {
            Some(storage) => storage,
            None => match &config.storage {
                StorageConfig::Memory => Arc::new(MemoryStorage::new()),
                StorageConfig::Filesystem { path, capacity } => {
                    Arc::new(FilesystemStorage::new(path.clone(), *capacity).await?)
                }
            },
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(
                endpoints.clone(),
                config.dock.rpc_timeout(),
            )?),
        };
        let keys = self.keys.unwrap_or_else(|| Arc::new(KeyPair::generate()));

        tracing::info!(
            "{}: starting node at {} with {} storage over {}",
            id.fmt_short(),
            endpoints,
            storage.name(),
            transport.name()
        );

        let local = LocalPeer::new(id, endpoints, storage);
        let dock = Dock::new(local.clone(), transport, config.dock.clone());

        let (overlay, kouncil): (Arc<dyn Overlay>, Option<Arc<Kouncil>>) = match &config.overlay {
            OverlayConfig::Kouncil(kouncil_config) => {
                let kouncil = Kouncil::new(local.clone(), dock.clone(), kouncil_config.clone()).await?;
                let seeds = kouncil_config
                    .bootstrap
                    .iter()
                    .map(|seed| Endpoints::from_iter([Endpoint::from(seed.as_str())]))
                    .collect();
                kouncil.bootstrap(seeds);
                let overlay: Arc<dyn Overlay> = kouncil.clone();
                (overlay, Some(kouncil))
            }
            OverlayConfig::Stonehenge { members } => {
                let locations = members
                    .iter()
                    .map(|member| {
                        NodeLocation::new(
                            member.id,
                            member
                                .endpoints
                                .iter()
                                .map(|endpoint| Endpoint::from(endpoint.as_str()))
                                .collect(),
                        )
                    })
                    .collect();
                let overlay: Arc<dyn Overlay> = Arc::new(Stonehenge::new(dock.clone(), locations)?);
                (overlay, None)
            }
        };

        let consensus: Arc<dyn Consensus> =
            Arc::new(QuorumConsensus::new(overlay.clone(), config.replication));
        let doughnut = Arc::new(Doughnut::new(id, keys, overlay.clone(), consensus));

        Ok(Node {
            id,
            local,
            dock,
            overlay,
            kouncil,
            doughnut,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStats {
    pub id: Address,
    pub endpoints: Endpoints,
    pub blocks: usize,
    pub sessions: usize,
    pub cached_peers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kouncil: Option<KouncilStats>,
}

/// A running block store node.
pub struct Node {
    id: Address,
    local: Arc<LocalPeer>,
    dock: Arc<Dock>,
    overlay: Arc<dyn Overlay>,
    kouncil: Option<Arc<Kouncil>>,
    doughnut: Arc<Doughnut>,
}

impl Node {
    pub fn id(&self) -> Address {
        self.id
    }

    pub fn local(&self) -> &Arc<LocalPeer> {
        &self.local
    }

    pub fn dock(&self) -> &Arc<Dock> {
        &self.dock
    }

    pub fn overlay(&self) -> &Arc<dyn Overlay> {
        &self.overlay
    }

    pub fn kouncil(&self) -> Option<&Arc<Kouncil>> {
        self.kouncil.as_ref()
    }

    pub fn doughnut(&self) -> &Arc<Doughnut> {
        &self.doughnut
    }

    /// Entry point for requests arriving from other nodes.
    pub fn service(&self) -> Arc<dyn Service> {
        self.local.clone()
    }

    pub async fn stats(&self) -> Result<NodeStats> {
        let kouncil = match &self.kouncil {
            Some(kouncil) => Some(kouncil.stats().await),
            None => None,
        };
        Ok(NodeStats {
            id: self.id,
            endpoints: self.local.endpoints().clone(),
            blocks: self.local.addresses().await?.len(),
            sessions: self.local.session_count().await,
            cached_peers: self.dock.live_peers(),
            kouncil,
        })
    }

    /// Stop the overlay's background work and drop its connections.
    pub async fn shutdown(&self) {
        self.overlay.shutdown().await;
        tracing::info!("{}: node stopped", self.id.fmt_short());
    }
}
