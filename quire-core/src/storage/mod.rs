//! Storage backends for the local peer.
//!
//! The core only relies on the four operations of [`Storage`]; durability
//! and layout are left to the backend.

pub mod filesystem;
pub mod memory;

pub use filesystem::FilesystemStorage;
pub use memory::MemoryStorage;

use crate::address::Address;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &Address) -> Result<Bytes>;

    /// Write `value` under `key`. `insert` allows creating the key and
    /// `update` allows overwriting it. Returns the change in stored bytes.
    async fn set(&self, key: &Address, value: Bytes, insert: bool, update: bool) -> Result<i64>;

    /// Returns the change in stored bytes.
    async fn erase(&self, key: &Address) -> Result<i64>;

    async fn list(&self) -> Result<Vec<Address>>;

    fn name(&self) -> &'static str;
}
