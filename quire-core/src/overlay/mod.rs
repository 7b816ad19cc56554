//! Overlays decide which peers hold, or should hold, a block.

pub mod kouncil;
pub mod stonehenge;

pub use kouncil::{Kouncil, KouncilStats, PeerInfo, PeerInfos};
pub use stonehenge::Stonehenge;

use crate::address::Address;
use crate::error::Result;
use crate::peer::Member;
use async_trait::async_trait;

#[async_trait]
pub trait Overlay: Send + Sync {
    fn id(&self) -> Address;

    /// Up to `n` peers to place a new block on.
    async fn allocate(&self, address: &Address, n: usize) -> Result<Vec<Member>>;

    /// Up to `n` peers believed to hold `address`. May be empty.
    async fn lookup(&self, address: &Address, n: usize) -> Result<Vec<Member>>;

    async fn lookup_node(&self, id: &Address) -> Result<Member>;

    /// Stop background work. Must complete before the overlay is dropped.
    async fn shutdown(&self);
}
