use super::{Peer, PeerEvent, StoreMode};
use crate::address::Address;
use crate::block::Block;
use crate::config::DockConfig;
use crate::dock::{retry_with_backoff, PeerDirectory};
use crate::error::{QuireError, Result};
use crate::overlay::PeerInfos;
use crate::rpc::{Envelope, Request, Response};
use crate::transport::{Channel, Endpoints, Service, Transport};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 64;

/// What every remote peer built by one dock shares.
#[derive(Clone)]
pub(crate) struct RemoteContext {
    pub local_id: Address,
    pub local_endpoints: Endpoints,
    pub transport: Arc<dyn Transport>,
    pub inbound: Arc<dyn Service>,
    pub directory: Option<Weak<dyn PeerDirectory>>,
    pub config: DockConfig,
}

/// A node reached over a [`Transport`].
///
/// The connection is opened lazily and reopened on demand; a call that
/// fails at the transport level marks the peer disconnected and is retried
/// once on a fresh connection.
pub struct RemotePeer {
    me: Weak<RemotePeer>,
    context: RemoteContext,
    serial: u64,
    id: RwLock<Option<Address>>,
    endpoints: RwLock<Endpoints>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<PeerEvent>,
    close_watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RemotePeer {
    pub(crate) fn new(
        context: RemoteContext,
        id: Option<Address>,
        endpoints: Endpoints,
        serial: u64,
    ) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            context,
            serial,
            id: RwLock::new(id),
            endpoints: RwLock::new(endpoints),
            channel: Mutex::new(None),
            connected,
            events,
            close_watcher: std::sync::Mutex::new(None),
        })
    }

    /// Distinguishes successive peer objects built for the same node.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
            .read()
            .map(|endpoints| endpoints.clone())
            .unwrap_or_default()
    }

    pub fn add_endpoints(&self, endpoints: &Endpoints) -> bool {
        self.endpoints
            .write()
            .map(|mut current| current.merge(endpoints))
            .unwrap_or(false)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Drops the current connection, if any.
    pub async fn disconnect(&self) {
        let channel = self.channel.lock().await.take();
        if channel.is_some() {
            self.abort_close_watcher();
            self.set_connected(false);
        }
    }

    pub async fn fetch_entries(&self) -> Result<BTreeSet<Address>> {
        self.call(Request::KouncilFetchEntries).await?.into_entries()
    }

    pub async fn lookup(&self, address: &Address) -> Result<BTreeSet<Address>> {
        self.call(Request::KouncilLookup { address: *address })
            .await?
            .into_nodes()
    }

    pub async fn advertise(&self, infos: PeerInfos) -> Result<PeerInfos> {
        self.call(Request::KouncilAdvertise { infos })
            .await?
            .into_peer_infos()
    }

    pub async fn discover(&self, infos: PeerInfos) -> Result<()> {
        self.call(Request::KouncilDiscover { infos }).await?.into_done()
    }

    pub async fn add_entries(&self, entries: BTreeSet<Address>) -> Result<()> {
        self.call(Request::KouncilAddEntries { entries })
            .await?
            .into_done()
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let mut retried = false;
        loop {
            let channel = self.channel().await?;
            let envelope = Envelope::new(Some(self.context.local_id), request.clone());
            let result =
                match tokio::time::timeout(self.context.config.rpc_timeout(), channel.call(envelope))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(QuireError::Network(format!(
                        "{} timed out",
                        request.method()
                    ))),
                };

            match result {
                Err(error) if error.is_network() => {
                    tracing::debug!(
                        "{} to {} failed: {}",
                        request.method(),
                        self.describe(),
                        error
                    );
                    self.mark_disconnected(&channel).await;
                    if retried {
                        return Err(error);
                    }
                    retried = true;
                }
                other => return other,
            }
        }
    }

    async fn channel(&self) -> Result<Arc<dyn Channel>> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            if !channel.is_closed() {
                return Ok(channel.clone());
            }
        }

        let config = &self.context.config;
        let channel = retry_with_backoff(
            config.connect_attempts,
            config.backoff_start(),
            config.backoff_max(),
            || self.open(),
        )
        .await?;
        *slot = Some(channel.clone());
        drop(slot);

        self.watch_close(channel.clone());
        self.set_connected(true);
        Ok(channel)
    }

    async fn open(&self) -> Result<Arc<dyn Channel>> {
        let endpoints = self.refresh_endpoints().await;
        let config = &self.context.config;
        let channel = tokio::time::timeout(
            config.connect_timeout(),
            self.context
                .transport
                .connect(&endpoints, self.context.inbound.clone()),
        )
        .await
        .map_err(|_| QuireError::Network(format!("connecting to {} timed out", endpoints)))??;

        let hello = Envelope::new(
            Some(self.context.local_id),
            Request::Hello {
                id: self.context.local_id,
                endpoints: self.context.local_endpoints.clone(),
            },
        );
        let id = tokio::time::timeout(config.rpc_timeout(), channel.call(hello))
            .await
            .map_err(|_| QuireError::Network(format!("handshake with {} timed out", endpoints)))??
            .into_hello()?;

        match self.id() {
            Some(expected) if expected != id => {
                return Err(QuireError::Network(format!(
                    "expected node {} at {} but reached {}",
                    expected.fmt_short(),
                    endpoints,
                    id.fmt_short()
                )));
            }
            Some(_) => {}
            None => {
                if let Ok(mut slot) = self.id.write() {
                    *slot = Some(id);
                }
            }
        }

        tracing::debug!("connected to {} at {}", id.fmt_short(), endpoints);
        Ok(channel)
    }

    async fn refresh_endpoints(&self) -> Endpoints {
        let directory = self.context.directory.as_ref().and_then(Weak::upgrade);
        if let (Some(id), Some(directory)) = (self.id(), directory) {
            if let Some(endpoints) = directory.endpoints(&id).await {
                self.add_endpoints(&endpoints);
            }
        }
        self.endpoints()
    }

    fn watch_close(&self, channel: Arc<dyn Channel>) {
        let me = self.me.clone();
        let handle = tokio::spawn(async move {
            channel.closed().await;
            if let Some(peer) = me.upgrade() {
                peer.mark_disconnected(&channel).await;
            }
        });

        if let Ok(mut slot) = self.close_watcher.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    fn abort_close_watcher(&self) {
        if let Ok(mut slot) = self.close_watcher.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    async fn mark_disconnected(&self, channel: &Arc<dyn Channel>) {
        let mut slot = self.channel.lock().await;
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, channel) => {
                *slot = None;
            }
            _ => return,
        }
        drop(slot);
        self.set_connected(false);
    }

    fn set_connected(&self, connected: bool) {
        if self.connected.send_replace(connected) == connected {
            return;
        }
        let event = if connected {
            PeerEvent::Connected
        } else {
            PeerEvent::Disconnected
        };
        tracing::debug!("{}: {:?}", self.describe(), event);
        let _ = self.events.send(event);
    }

    fn describe(&self) -> String {
        match self.id() {
            Some(id) => format!("peer {}#{}", id.fmt_short(), self.serial),
            None => format!("peer {}#{}", self.endpoints(), self.serial),
        }
    }
}

impl Drop for RemotePeer {
    fn drop(&mut self) {
        self.abort_close_watcher();
    }
}

#[async_trait]
impl Peer for RemotePeer {
    fn id(&self) -> Option<Address> {
        self.id.read().ok().and_then(|id| *id)
    }

    async fn connect(&self) -> Result<()> {
        self.channel().await.map(|_| ())
    }

    async fn store(&self, block: &Block, mode: StoreMode) -> Result<()> {
        self.call(Request::Store {
            block: block.clone(),
            mode,
        })
        .await?
        .into_done()
    }

    async fn fetch(&self, address: &Address) -> Result<Block> {
        self.call(Request::Fetch { address: *address })
            .await?
            .into_block()
    }

    async fn remove(&self, address: &Address) -> Result<()> {
        self.call(Request::Remove { address: *address })
            .await?
            .into_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::LocalPeer;
    use crate::storage::MemoryStorage;
    use crate::transport::{Endpoint, MemoryNetwork};
    use std::time::Duration;

    fn quick() -> DockConfig {
        DockConfig {
            connect_attempts: 2,
            backoff_start_ms: 10,
            backoff_max_ms: 20,
            connect_timeout_ms: 500,
            rpc_timeout_ms: 500,
            ..DockConfig::default()
        }
    }

    async fn serving(network: &Arc<MemoryNetwork>, name: &str) -> Arc<LocalPeer> {
        let endpoints: Endpoints = [name].into_iter().collect();
        let local = LocalPeer::new(Address::random(), endpoints, Arc::new(MemoryStorage::new()));
        network.listen(Endpoint::from(name), local.clone()).await;
        local
    }

    fn context(network: &Arc<MemoryNetwork>, client: &Arc<LocalPeer>, name: &str) -> RemoteContext {
        RemoteContext {
            local_id: client.node_id(),
            local_endpoints: client.endpoints().clone(),
            transport: Arc::new(network.transport(Some(Endpoint::from(name)))),
            inbound: client.clone(),
            directory: None,
            config: quick(),
        }
    }

    #[tokio::test]
    async fn test_anonymous_peer_learns_id_on_connect() {
        let network = MemoryNetwork::new();
        let server = serving(&network, "a").await;
        let client = serving(&network, "b").await;

        let remote = RemotePeer::new(
            context(&network, &client, "b"),
            None,
            ["a"].into_iter().collect(),
            1,
        );
        let mut events = remote.subscribe();
        remote.connect().await.unwrap();
        assert_eq!(remote.id(), Some(server.node_id()));
        assert_eq!(events.recv().await.unwrap(), PeerEvent::Connected);
        assert_eq!(server.session_count().await, 1);

        let block = Block::immutable("remote");
        remote.store(&block, StoreMode::Insert).await.unwrap();
        assert_eq!(remote.fetch(&block.address()).await.unwrap(), block);
    }

    #[tokio::test]
    async fn test_wrong_identity_is_refused() {
        let network = MemoryNetwork::new();
        serving(&network, "a").await;
        let client = serving(&network, "b").await;

        let remote = RemotePeer::new(
            context(&network, &client, "b"),
            Some(Address::hash(b"someone else")),
            ["a"].into_iter().collect(),
            1,
        );
        assert!(matches!(remote.connect().await, Err(QuireError::Network(_))));
        assert!(!remote.is_connected());
    }

    #[tokio::test]
    async fn test_severed_link_emits_disconnected_then_reconnects() {
        let network = MemoryNetwork::new();
        serving(&network, "a").await;
        let client = serving(&network, "b").await;

        let remote = RemotePeer::new(
            context(&network, &client, "b"),
            None,
            ["a"].into_iter().collect(),
            1,
        );
        remote.connect().await.unwrap();
        let mut events = remote.subscribe();

        network.sever(&Endpoint::from("a")).await;
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, PeerEvent::Disconnected);

        // Any call reopens the connection.
        assert!(remote.fetch_entries().await.is_err());
        assert!(remote.is_connected());
    }

    #[tokio::test]
    async fn test_missing_block_is_not_a_network_failure() {
        let network = MemoryNetwork::new();
        serving(&network, "a").await;
        let client = serving(&network, "b").await;
        let remote = RemotePeer::new(
            context(&network, &client, "b"),
            None,
            ["a"].into_iter().collect(),
            1,
        );

        let result = remote.fetch(&Address::hash(b"absent")).await;
        assert!(matches!(result, Err(QuireError::MissingBlock(_))));
        assert!(remote.is_connected());
    }
}
