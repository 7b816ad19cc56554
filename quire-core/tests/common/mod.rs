#![allow(dead_code)]

use quire_core::{
    Address, DockConfig, Endpoint, KeyPair, Kouncil, KouncilConfig, MemoryNetwork, Node,
    NodeBuilder, NodeConfig, OverlayConfig, ReplicationConfig, StorageConfig,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

pub fn fast_config(name: &str, bootstrap: &[&str], replication: ReplicationConfig) -> NodeConfig {
    NodeConfig {
        node_id: None,
        listen: name.to_string(),
        advertise: Vec::new(),
        storage: StorageConfig::Memory,
        replication,
        overlay: OverlayConfig::Kouncil(KouncilConfig {
            bootstrap: bootstrap.iter().map(|seed| seed.to_string()).collect(),
            watcher_interval_ms: 50,
            contact_ceiling_ms: 200,
            broadcast_batch: 64,
        }),
        dock: DockConfig {
            disable_peer_cache: false,
            connect_timeout_ms: 1_000,
            rpc_timeout_ms: 2_000,
            connect_attempts: 2,
            backoff_start_ms: 20,
            backoff_max_ms: 100,
        },
    }
}

/// Nodes sharing one in-memory network.
pub struct Cluster {
    pub network: Arc<MemoryNetwork>,
    pub nodes: Vec<Node>,
    names: Vec<String>,
}

impl Cluster {
    /// `size` nodes named `n0..`, each bootstrapping from `n0`.
    pub async fn start(size: usize, replication: ReplicationConfig) -> Self {
        Self::start_with_keys(size, replication, |_| Arc::new(KeyPair::generate())).await
    }

    pub async fn start_with_keys(
        size: usize,
        replication: ReplicationConfig,
        keys: impl Fn(usize) -> Arc<KeyPair>,
    ) -> Self {
        let mut cluster = Cluster {
            network: MemoryNetwork::new(),
            nodes: Vec::new(),
            names: Vec::new(),
        };
        for index in 0..size {
            let name = format!("n{}", index);
            let seeds: &[&str] = if index == 0 { &[] } else { &["n0"] };
            let node = NodeBuilder::new(fast_config(&name, seeds, replication))
                .transport(Arc::new(cluster.network.transport(Some(Endpoint::from(name.as_str())))))
                .keys(keys(index))
                .build()
                .await
                .unwrap();
            cluster
                .network
                .listen(Endpoint::from(name.as_str()), node.service())
                .await;
            cluster.nodes.push(node);
            cluster.names.push(name);
        }
        cluster
    }

    pub fn kouncil(&self, index: usize) -> &Arc<Kouncil> {
        self.nodes[index].kouncil().unwrap()
    }

    pub fn id(&self, index: usize) -> Address {
        self.nodes[index].id()
    }

    pub async fn offline(&self, index: usize) {
        self.network
            .unlisten(&Endpoint::from(self.names[index].as_str()))
            .await;
    }

    pub async fn online(&self, index: usize) {
        self.network
            .listen(
                Endpoint::from(self.names[index].as_str()),
                self.nodes[index].service(),
            )
            .await;
    }

    /// Wait until every node is connected to every other one.
    pub async fn wait_fully_connected(&self) {
        let expected = self.nodes.len() - 1;
        for index in 0..self.nodes.len() {
            let kouncil = self.kouncil(index).clone();
            wait_for(&format!("n{} to see {} peers", index, expected), || {
                let kouncil = kouncil.clone();
                async move { kouncil.connected_peers().await.len() == expected }
            })
            .await;
        }
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

/// Poll `condition` until it holds, failing the test after a bounded wait.
pub async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    while !condition().await {
        if started.elapsed() > POLL_TIMEOUT {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
