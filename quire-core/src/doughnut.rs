//! The block store facade.
//!
//! [`Doughnut`] is what applications talk to: it builds blocks owned by the
//! node's key pair, seals them before every store and hands placement and
//! replication to the configured [`Consensus`] over an [`Overlay`].

use crate::address::Address;
use crate::block::{Block, ConflictResolver, UserBlock};
use crate::consensus::Consensus;
use crate::crypto::{KeyPair, PublicKey};
use crate::error::{QuireError, Result};
use crate::overlay::Overlay;
use crate::peer::StoreMode;
use bytes::Bytes;
use std::sync::Arc;

const MAX_RESOLVE_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub key: PublicKey,
}

pub struct Doughnut {
    id: Address,
    keys: Arc<KeyPair>,
    overlay: Arc<dyn Overlay>,
    consensus: Arc<dyn Consensus>,
}

impl Doughnut {
    pub fn new(
        id: Address,
        keys: Arc<KeyPair>,
        overlay: Arc<dyn Overlay>,
        consensus: Arc<dyn Consensus>,
    ) -> Self {
        Self {
            id,
            keys,
            overlay,
            consensus,
        }
    }

    pub fn id(&self) -> Address {
        self.id
    }

    pub fn keys(&self) -> &Arc<KeyPair> {
        &self.keys
    }

    pub fn overlay(&self) -> &Arc<dyn Overlay> {
        &self.overlay
    }

    pub fn make_immutable_block(&self, data: impl Into<Bytes>) -> Block {
        Block::immutable(data)
    }

    pub fn make_mutable_block(&self) -> Block {
        Block::mutable(&self.keys.public())
    }

    pub fn make_acl_block(&self) -> Block {
        Block::acl(&self.keys.public())
    }

    /// Seal `block` with our keys and store it. Returns the block as stored.
    pub async fn store(&self, mut block: Block, mode: StoreMode) -> Result<Block> {
        block.seal(&self.keys)?;
        self.consensus.store(&block, mode).await?;
        tracing::debug!(
            "{}: stored {} ({:?})",
            self.id.fmt_short(),
            block.address().fmt_short(),
            block.kind()
        );
        Ok(block)
    }

    /// Like [`Doughnut::store`], but when another writer's version wins,
    /// replay the edit on top of it with `resolver` and try again.
    pub async fn store_with_resolver(
        &self,
        mut block: Block,
        mut mode: StoreMode,
        resolver: &dyn ConflictResolver,
    ) -> Result<Block> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            block.seal(&self.keys)?;
            match self.consensus.store(&block, mode).await {
                Ok(()) => return Ok(block),
                Err(QuireError::Conflict { address, current }) if attempt < MAX_RESOLVE_ATTEMPTS => {
                    tracing::debug!(
                        "{}: conflict on {} at version {:?}, {}",
                        self.id.fmt_short(),
                        address.fmt_short(),
                        current.version(),
                        resolver.description()
                    );
                    block = resolver.resolve(&block, *current)?;
                    mode = StoreMode::Update;
                }
                Err(error) => return Err(error),
            }
        }
    }

    pub async fn fetch(&self, address: &Address) -> Result<Block> {
        self.consensus.fetch(address).await
    }

    pub async fn remove(&self, address: &Address) -> Result<()> {
        self.consensus.remove(address).await
    }

    /// Bind `name` to our public key, in both directions.
    pub async fn register_user(&self, name: &str) -> Result<User> {
        let key = self.keys.public();
        match self.user_by_name(name).await {
            Ok(user) if user.key != key => {
                return Err(QuireError::UserConflict(format!(
                    "{} is already registered to {}",
                    name,
                    user.key.fmt_short()
                )));
            }
            Ok(_) | Err(QuireError::MissingBlock(_)) => {}
            Err(error) => return Err(error),
        }
        let bound = self.user_by_key(&key).await?;
        if !bound.name.is_empty() && bound.name != name {
            return Err(QuireError::UserConflict(format!(
                "{} is already registered as {}",
                key.fmt_short(),
                bound.name
            )));
        }

        for reverse in [false, true] {
            let block = Block::User(UserBlock::new(name, &self.keys, reverse)?);
            match self.consensus.store(&block, StoreMode::Insert).await {
                Ok(()) => {}
                // Someone else won the race for the same binding.
                Err(QuireError::InvalidBlock { .. }) | Err(QuireError::Collision(_)) => {
                    return Err(QuireError::UserConflict(format!(
                        "{} was registered concurrently",
                        name
                    )));
                }
                Err(error) => return Err(error),
            }
        }

        tracing::info!("{}: registered user {} as {}", self.id.fmt_short(), name, key.fmt_short());
        Ok(User {
            name: name.to_string(),
            key,
        })
    }

    pub async fn user_by_name(&self, name: &str) -> Result<User> {
        let address = UserBlock::forward_address(name);
        let block = self.fetch(&address).await?;
        let user = block
            .as_user()
            .filter(|user| !user.is_reverse() && user.name() == name)
            .ok_or_else(|| QuireError::invalid(address, "not a user block for this name"))?;
        Ok(User {
            name: user.name().to_string(),
            key: *user.key(),
        })
    }

    /// Unknown keys resolve to a user with an empty name.
    pub async fn user_by_key(&self, key: &PublicKey) -> Result<User> {
        let address = UserBlock::reverse_address(key);
        let block = match self.fetch(&address).await {
            Ok(block) => block,
            Err(QuireError::MissingBlock(_)) => {
                return Ok(User {
                    name: String::new(),
                    key: *key,
                })
            }
            Err(error) => return Err(error),
        };
        let user = block
            .as_user()
            .filter(|user| user.is_reverse() && user.key() == key)
            .ok_or_else(|| QuireError::invalid(address, "not a user block for this key"))?;
        Ok(User {
            name: user.name().to_string(),
            key: *key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::AclConflictResolver;
    use crate::config::{DockConfig, ReplicationConfig};
    use crate::consensus::QuorumConsensus;
    use crate::dock::{Dock, NodeLocation};
    use crate::overlay::Stonehenge;
    use crate::peer::LocalPeer;
    use crate::storage::MemoryStorage;
    use crate::transport::MemoryNetwork;

    fn doughnut_with(keys: Arc<KeyPair>) -> Doughnut {
        let network = MemoryNetwork::new();
        let id = Address::random();
        let local = LocalPeer::new(id, ["solo"].into_iter().collect(), Arc::new(MemoryStorage::new()));
        let dock = Dock::new(local.clone(), Arc::new(network.transport(None)), DockConfig::default());
        let overlay: Arc<dyn Overlay> = Arc::new(
            Stonehenge::new(dock, vec![NodeLocation::new(id, local.endpoints().clone())]).unwrap(),
        );
        let consensus = Arc::new(QuorumConsensus::new(
            overlay.clone(),
            ReplicationConfig::new(1, 1).unwrap(),
        ));
        Doughnut::new(id, keys, overlay, consensus)
    }

    fn doughnut() -> Doughnut {
        doughnut_with(Arc::new(KeyPair::generate()))
    }

    #[tokio::test]
    async fn test_immutable_round_trip() {
        let doughnut = doughnut();
        let block = doughnut
            .store(doughnut.make_immutable_block("hello"), StoreMode::Insert)
            .await
            .unwrap();
        let fetched = doughnut.fetch(&block.address()).await.unwrap();
        assert_eq!(fetched.data(), Bytes::from("hello"));

        doughnut.remove(&block.address()).await.unwrap();
        assert!(matches!(
            doughnut.fetch(&block.address()).await,
            Err(QuireError::MissingBlock(_))
        ));
    }

    #[tokio::test]
    async fn test_mutable_updates_bump_version() {
        let doughnut = doughnut();
        let mut block = doughnut.make_mutable_block();
        block.set_data("v1").unwrap();
        let mut block = doughnut.store(block, StoreMode::Insert).await.unwrap();
        assert_eq!(block.version(), Some(1));

        block.set_data("v2").unwrap();
        let block = doughnut.store(block, StoreMode::Update).await.unwrap();
        let fetched = doughnut.fetch(&block.address()).await.unwrap();
        assert_eq!(fetched.version(), Some(2));
        assert_eq!(fetched.data(), Bytes::from("v2"));
    }

    #[tokio::test]
    async fn test_concurrent_acl_edits_are_merged() {
        let doughnut = doughnut();
        let alice = KeyPair::generate().public();
        let bob = KeyPair::generate().public();

        let base = doughnut
            .store(doughnut.make_acl_block(), StoreMode::Insert)
            .await
            .unwrap();

        let mut first = base.clone();
        first.as_acl_mut().unwrap().set_permissions(&alice, true, false).unwrap();
        doughnut
            .store_with_resolver(first, StoreMode::Update, &AclConflictResolver::new(alice, true, false))
            .await
            .unwrap();

        // Edited from the same base, so it loses the race and gets replayed.
        let mut second = base.clone();
        second.as_acl_mut().unwrap().set_permissions(&bob, true, true).unwrap();
        let stored = doughnut
            .store_with_resolver(second, StoreMode::Update, &AclConflictResolver::new(bob, true, true))
            .await
            .unwrap();
        assert_eq!(stored.version(), Some(3));

        let fetched = doughnut.fetch(&base.address()).await.unwrap();
        let acl = fetched.as_acl().unwrap();
        assert!(acl.can_read(&alice) && !acl.can_write(&alice));
        assert!(acl.can_write(&bob));
    }

    #[tokio::test]
    async fn test_stale_store_without_resolver_conflicts() {
        let doughnut = doughnut();
        let mut block = doughnut.make_mutable_block();
        block.set_data("a").unwrap();
        let base = doughnut.store(block, StoreMode::Insert).await.unwrap();

        let mut newer = base.clone();
        newer.set_data("b").unwrap();
        doughnut.store(newer, StoreMode::Update).await.unwrap();

        let mut stale = base;
        stale.set_data("c").unwrap();
        assert!(matches!(
            doughnut.store(stale, StoreMode::Update).await,
            Err(QuireError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_register_user_binds_both_directions() {
        let keys = Arc::new(KeyPair::generate());
        let doughnut = doughnut_with(keys.clone());

        let user = doughnut.register_user("ada").await.unwrap();
        assert_eq!(user.key, keys.public());
        assert_eq!(doughnut.user_by_name("ada").await.unwrap(), user);
        assert_eq!(doughnut.user_by_key(&keys.public()).await.unwrap().name, "ada");

        // Registering again with the same key is a no-op.
        doughnut.register_user("ada").await.unwrap();
        assert!(matches!(
            doughnut.register_user("lovelace").await,
            Err(QuireError::UserConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_key_has_empty_name() {
        let doughnut = doughnut();
        let stranger = KeyPair::generate().public();
        let user = doughnut.user_by_key(&stranger).await.unwrap();
        assert!(user.name.is_empty());
        assert_eq!(user.key, stranger);
        assert!(matches!(
            doughnut.user_by_name("nobody").await,
            Err(QuireError::MissingBlock(_))
        ));
    }
}
