//! Peer construction and caching.
//!
//! The dock is the only place that knows whether we already hold a peer
//! object for a given node. Remote peers are cached weakly: once nobody
//! holds one it is rebuilt (with a new serial) on the next request.

use crate::address::Address;
use crate::config::DockConfig;
use crate::error::{QuireError, Result};
use crate::peer::remote::RemoteContext;
use crate::peer::{LocalPeer, Member, Peer, RemotePeer};
use crate::transport::{Endpoints, Transport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

/// Source of up-to-date endpoints for a node, consulted before every
/// connection attempt.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn endpoints(&self, id: &Address) -> Option<Endpoints>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLocation {
    pub id: Option<Address>,
    pub endpoints: Endpoints,
}

impl NodeLocation {
    pub fn new(id: Address, endpoints: Endpoints) -> Self {
        Self {
            id: Some(id),
            endpoints,
        }
    }

    pub fn anonymous(endpoints: Endpoints) -> Self {
        Self {
            id: None,
            endpoints,
        }
    }
}

pub struct Dock {
    local: Arc<LocalPeer>,
    transport: Arc<dyn Transport>,
    config: DockConfig,
    directory: RwLock<Option<Weak<dyn PeerDirectory>>>,
    cache: Mutex<HashMap<Address, Weak<RemotePeer>>>,
    serial: AtomicU64,
}

impl Dock {
    pub fn new(local: Arc<LocalPeer>, transport: Arc<dyn Transport>, config: DockConfig) -> Arc<Self> {
        if config.disable_peer_cache {
            tracing::info!("peer cache disabled");
        }
        Arc::new(Self {
            local,
            transport,
            config,
            directory: RwLock::new(None),
            cache: Mutex::new(HashMap::new()),
            serial: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> Address {
        self.local.node_id()
    }

    pub fn local(&self) -> &Arc<LocalPeer> {
        &self.local
    }

    pub fn config(&self) -> &DockConfig {
        &self.config
    }

    /// Lets peers built from now on refresh their endpoints from `directory`.
    pub fn attach(&self, directory: Weak<dyn PeerDirectory>) {
        if let Ok(mut slot) = self.directory.write() {
            *slot = Some(directory);
        }
    }

    pub fn cached(&self, id: &Address) -> Option<Arc<RemotePeer>> {
        self.cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(id).and_then(Weak::upgrade))
    }

    /// Number of cached remote peers still alive.
    pub fn live_peers(&self) -> usize {
        self.cache
            .lock()
            .map(|cache| cache.values().filter(|peer| peer.strong_count() > 0).count())
            .unwrap_or(0)
    }

    pub async fn make_peer(&self, location: &NodeLocation) -> Result<Member> {
        match location.id {
            Some(id) if id == self.id() => Ok(Member::Local(self.local.clone())),
            Some(id) => {
                if let Some(peer) = self.cached_if_enabled(&id) {
                    peer.add_endpoints(&location.endpoints);
                    return Ok(Member::Remote(peer));
                }
                let peer = self.build(Some(id), location.endpoints.clone());
                self.adopt(id, &peer);
                Ok(Member::Remote(peer))
            }
            None => self.make_anonymous(&location.endpoints).await,
        }
    }

    async fn make_anonymous(&self, endpoints: &Endpoints) -> Result<Member> {
        let peer = self.build(None, endpoints.clone());
        peer.connect().await?;
        let id = peer
            .id()
            .ok_or_else(|| QuireError::Internal(format!("no identity learned from {}", endpoints)))?;

        if id == self.id() {
            tracing::debug!("{} is ourselves", endpoints);
            return Ok(Member::Local(self.local.clone()));
        }
        if let Some(existing) = self.cached_if_enabled(&id) {
            existing.add_endpoints(endpoints);
            return Ok(Member::Remote(existing));
        }
        self.adopt(id, &peer);
        Ok(Member::Remote(peer))
    }

    fn cached_if_enabled(&self, id: &Address) -> Option<Arc<RemotePeer>> {
        if self.config.disable_peer_cache {
            return None;
        }
        self.cached(id)
    }

    fn adopt(&self, id: Address, peer: &Arc<RemotePeer>) {
        if self.config.disable_peer_cache {
            return;
        }
        if let Ok(mut cache) = self.cache.lock() {
            cache.retain(|_, peer| peer.strong_count() > 0);
            cache.insert(id, Arc::downgrade(peer));
        }
    }

    fn build(&self, id: Option<Address>, endpoints: Endpoints) -> Arc<RemotePeer> {
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        let directory = self.directory.read().ok().and_then(|slot| slot.clone());
        let context = RemoteContext {
            local_id: self.id(),
            local_endpoints: self.local.endpoints().clone(),
            transport: self.transport.clone(),
            inbound: self.local.clone(),
            directory,
            config: self.config.clone(),
        };
        RemotePeer::new(context, id, endpoints, serial)
    }
}

/// Retry `operation` on network errors, doubling the delay up to `max`.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    attempts: u32,
    start: Duration,
    max: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = start;
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_network() && attempt < attempts.max(1) => {
                tracing::trace!("attempt {} failed: {}, retrying in {:?}", attempt, error, delay);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max);
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
