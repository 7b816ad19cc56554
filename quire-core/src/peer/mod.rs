//! Uniform access to block holders, local or remote.

pub mod local;
pub mod remote;

pub use local::{LocalEvent, LocalPeer};
pub use remote::RemotePeer;

use crate::address::Address;
use crate::block::Block;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    /// The address must not exist yet.
    Insert,
    /// Replace the stored version; the new one must validate against it.
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Connected,
    Disconnected,
}

#[async_trait]
pub trait Peer: Send + Sync {
    /// `None` until a handshake has told us who is on the other side.
    fn id(&self) -> Option<Address>;

    /// Idempotent; returns once the peer is usable.
    async fn connect(&self) -> Result<()>;

    async fn store(&self, block: &Block, mode: StoreMode) -> Result<()>;

    async fn fetch(&self, address: &Address) -> Result<Block>;

    async fn remove(&self, address: &Address) -> Result<()>;
}

/// A peer as handed out by overlays.
#[derive(Clone)]
pub enum Member {
    Local(Arc<LocalPeer>),
    Remote(Arc<RemotePeer>),
}

impl Member {
    pub fn is_local(&self) -> bool {
        matches!(self, Member::Local(_))
    }

    pub fn as_remote(&self) -> Option<&Arc<RemotePeer>> {
        match self {
            Member::Remote(remote) => Some(remote),
            Member::Local(_) => None,
        }
    }

    fn peer(&self) -> &dyn Peer {
        match self {
            Member::Local(local) => local.as_ref(),
            Member::Remote(remote) => remote.as_ref(),
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id().map(|id| id.fmt_short()).unwrap_or_else(|| "?".to_string());
        match self {
            Member::Local(_) => write!(f, "Local({})", id),
            Member::Remote(_) => write!(f, "Remote({})", id),
        }
    }
}

#[async_trait]
impl Peer for Member {
    fn id(&self) -> Option<Address> {
        self.peer().id()
    }

    async fn connect(&self) -> Result<()> {
        self.peer().connect().await
    }

    async fn store(&self, block: &Block, mode: StoreMode) -> Result<()> {
        self.peer().store(block, mode).await
    }

    async fn fetch(&self, address: &Address) -> Result<Block> {
        self.peer().fetch(address).await
    }

    async fn remove(&self, address: &Address) -> Result<()> {
        self.peer().remove(address).await
    }
}
