use super::{Peer, StoreMode};
use crate::address::Address;
use crate::block::Block;
use crate::error::{QuireError, Result};
use crate::rpc::{Envelope, Request, Response};
use crate::storage::Storage;
use crate::transport::{Channel, Endpoints, Service};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{broadcast, Mutex};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEvent {
    Stored(Address),
    Removed(Address),
}

/// The block store hosted by this node.
pub struct LocalPeer {
    id: Address,
    endpoints: Endpoints,
    storage: Arc<dyn Storage>,
    events: broadcast::Sender<LocalEvent>,
    // Back channels of peers that said hello, by their id.
    sessions: Mutex<HashMap<Address, Arc<dyn Channel>>>,
    // Serializes read-validate-write on the same store.
    write_lock: Mutex<()>,
    overlay: RwLock<Option<Weak<dyn Service>>>,
}

impl LocalPeer {
    pub fn new(id: Address, endpoints: Endpoints, storage: Arc<dyn Storage>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            id,
            endpoints,
            storage,
            events,
            sessions: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
            overlay: RwLock::new(None),
        })
    }

    pub fn node_id(&self) -> Address {
        self.id
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LocalEvent> {
        self.events.subscribe()
    }

    /// Routes `kouncil_*` requests to `overlay`.
    pub fn set_overlay(&self, overlay: Weak<dyn Service>) {
        if let Ok(mut slot) = self.overlay.write() {
            *slot = Some(overlay);
        }
    }

    pub fn clear_overlay(&self) {
        if let Ok(mut slot) = self.overlay.write() {
            *slot = None;
        }
    }

    fn overlay(&self) -> Option<Arc<dyn Service>> {
        self.overlay
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(Weak::upgrade))
    }

    pub async fn addresses(&self) -> Result<Vec<Address>> {
        self.storage.list().await
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Push `request` to every peer connected to us, dropping sessions
    /// whose push fails. Returns how many received it.
    pub async fn broadcast(&self, request: Request) -> usize {
        let sessions: Vec<(Address, Arc<dyn Channel>)> = self
            .sessions
            .lock()
            .await
            .iter()
            .map(|(id, channel)| (*id, channel.clone()))
            .collect();

        let pushes = sessions.iter().map(|(id, channel)| {
            let envelope = Envelope::new(Some(self.id), request.clone());
            async move { (*id, channel.call(envelope).await.and_then(Response::into_done)) }
        });

        let mut failed = Vec::new();
        for (id, result) in join_all(pushes).await {
            if let Err(error) = result {
                tracing::debug!(
                    "dropping session of {} after failed {}: {}",
                    id.fmt_short(),
                    request.method(),
                    error
                );
                failed.push(id);
            }
        }

        if !failed.is_empty() {
            let mut sessions = self.sessions.lock().await;
            for id in &failed {
                sessions.remove(id);
            }
        }
        sessions.len() - failed.len()
    }

    pub async fn store_block(&self, block: &Block, mode: StoreMode) -> Result<()> {
        block.validate()?;
        let address = block.address();

        let _guard = self.write_lock.lock().await;
        let current = match self.storage.get(&address).await {
            Ok(bytes) => Some(Block::decode(&bytes)?),
            Err(QuireError::MissingBlock(_)) => None,
            Err(error) => return Err(error),
        };

        if let Some(current) = current {
            if !block.is_mutable() {
                // Same content at the same address: nothing to do.
                return block.validate_against(&current);
            }
            if block == &current {
                return Ok(());
            }
            if mode == StoreMode::Insert {
                return Err(QuireError::Collision(address));
            }
            if let Err(error) = block.validate_against(&current) {
                tracing::debug!(
                    "rejecting version {:?} of {}: {}",
                    block.version(),
                    address.fmt_short(),
                    error
                );
                return Err(QuireError::Conflict {
                    address,
                    current: Box::new(current),
                });
            }
        }

        self.storage
            .set(&address, block.encode()?, true, true)
            .await?;
        drop(_guard);

        tracing::trace!("{}: stored {}", self.id.fmt_short(), address.fmt_short());
        let _ = self.events.send(LocalEvent::Stored(address));
        Ok(())
    }

    pub async fn fetch_block(&self, address: &Address) -> Result<Block> {
        let bytes = self.storage.get(address).await?;
        let block = Block::decode(&bytes)?;
        if block.address() != *address {
            return Err(QuireError::invalid(*address, "stored under the wrong address"));
        }
        Ok(block)
    }

    pub async fn remove_block(&self, address: &Address) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.storage.erase(address).await?;
        drop(_guard);

        tracing::trace!("{}: removed {}", self.id.fmt_short(), address.fmt_short());
        let _ = self.events.send(LocalEvent::Removed(*address));
        Ok(())
    }

    async fn handle(&self, envelope: Envelope, back: Option<Arc<dyn Channel>>) -> Result<Response> {
        match envelope.request {
            Request::Hello { id, endpoints } => {
                tracing::debug!(
                    "{}: hello from {} at {}",
                    self.id.fmt_short(),
                    id.fmt_short(),
                    endpoints
                );
                if let Some(back) = back {
                    self.sessions.lock().await.insert(id, back);
                }
                Ok(Response::Hello { id: self.id })
            }
            Request::Store { block, mode } => {
                self.store_block(&block, mode).await?;
                Ok(Response::Done)
            }
            Request::Fetch { address } => Ok(Response::Block {
                block: self.fetch_block(&address).await?,
            }),
            Request::Remove { address } => {
                self.remove_block(&address).await?;
                Ok(Response::Done)
            }
            request => {
                let overlay = self.overlay().ok_or_else(|| {
                    QuireError::Internal(format!("no overlay to serve {}", request.method()))
                })?;
                let envelope = Envelope::new(envelope.sender, request);
                Ok(overlay.serve(envelope, back).await)
            }
        }
    }
}

#[async_trait]
impl Service for LocalPeer {
    async fn serve(&self, envelope: Envelope, back: Option<Arc<dyn Channel>>) -> Response {
        Response::from_result(self.handle(envelope, back).await)
    }
}

#[async_trait]
impl Peer for LocalPeer {
    fn id(&self) -> Option<Address> {
        Some(self.id)
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn store(&self, block: &Block, mode: StoreMode) -> Result<()> {
        self.store_block(block, mode).await
    }

    async fn fetch(&self, address: &Address) -> Result<Block> {
        self.fetch_block(address).await
    }

    async fn remove(&self, address: &Address) -> Result<()> {
        self.remove_block(address).await
    }
}
