//! Self-validating blocks.
//!
//! Every block can be checked on its own (`validate`) and, for mutable
//! kinds, against the version it replaces (`validate_against`). Nothing is
//! stored or forwarded without passing validation first.

pub mod acl;
pub mod immutable;
pub mod okb;
pub mod resolver;
pub mod user;

pub use acl::{AclBlock, AclEntry};
pub use immutable::ImmutableBlock;
pub use okb::{OkbHeader, OwnerKeyedBlock};
pub use resolver::{AclConflictResolver, ConflictResolver, ResolverChain};
pub use user::UserBlock;

use crate::address::Address;
use crate::crypto::{KeyPair, PublicKey};
use crate::error::{QuireError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Immutable,
    Mutable,
    Acl,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Immutable(ImmutableBlock),
    Mutable(OwnerKeyedBlock),
    Acl(AclBlock),
    User(UserBlock),
}

impl Block {
    pub fn immutable(data: impl Into<Bytes>) -> Self {
        Block::Immutable(ImmutableBlock::new(data))
    }

    pub fn mutable(owner: &PublicKey) -> Self {
        Block::Mutable(OwnerKeyedBlock::new(owner))
    }

    pub fn acl(owner: &PublicKey) -> Self {
        Block::Acl(AclBlock::new(owner))
    }

    pub fn address(&self) -> Address {
        match self {
            Block::Immutable(block) => block.address(),
            Block::Mutable(block) => block.address(),
            Block::Acl(block) => block.address(),
            Block::User(block) => block.address(),
        }
    }

    pub fn kind(&self) -> BlockKind {
        match self {
            Block::Immutable(_) => BlockKind::Immutable,
            Block::Mutable(_) => BlockKind::Mutable,
            Block::Acl(_) => BlockKind::Acl,
            Block::User(_) => BlockKind::User,
        }
    }

    pub fn is_mutable(&self) -> bool {
        matches!(self, Block::Mutable(_) | Block::Acl(_))
    }

    /// Payload bytes. User blocks expose the user name.
    pub fn data(&self) -> Bytes {
        match self {
            Block::Immutable(block) => block.data().clone(),
            Block::Mutable(block) => block.data().clone(),
            Block::Acl(block) => block.data().clone(),
            Block::User(block) => Bytes::copy_from_slice(block.name().as_bytes()),
        }
    }

    pub fn set_data(&mut self, data: impl Into<Bytes>) -> Result<()> {
        match self {
            Block::Mutable(block) => block.set_data(data),
            Block::Acl(block) => block.set_data(data),
            other => {
                return Err(QuireError::PermissionDenied(format!(
                    "{:?} block {} cannot be modified",
                    other.kind(),
                    other.address().fmt_short()
                )));
            }
        }
        Ok(())
    }

    pub fn version(&self) -> Option<u64> {
        match self {
            Block::Mutable(block) => Some(block.version()),
            Block::Acl(block) => Some(block.version()),
            _ => None,
        }
    }

    pub fn as_acl(&self) -> Option<&AclBlock> {
        match self {
            Block::Acl(block) => Some(block),
            _ => None,
        }
    }

    pub fn as_acl_mut(&mut self) -> Option<&mut AclBlock> {
        match self {
            Block::Acl(block) => Some(block),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserBlock> {
        match self {
            Block::User(block) => Some(block),
            _ => None,
        }
    }

    /// Sign and bump the version of mutable blocks. A no-op for the others,
    /// whose integrity is fixed at construction.
    pub fn seal(&mut self, keys: &KeyPair) -> Result<()> {
        match self {
            Block::Mutable(block) => block.seal(keys),
            Block::Acl(block) => block.seal(keys),
            Block::Immutable(_) | Block::User(_) => Ok(()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Block::Immutable(block) => block.validate(),
            Block::Mutable(block) => block.validate(),
            Block::Acl(block) => block.validate(),
            Block::User(block) => block.validate(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Validate `self` as the successor of `previous` at the same address.
    pub fn validate_against(&self, previous: &Block) -> Result<()> {
        if self.address() != previous.address() {
            return Err(QuireError::invalid(
                self.address(),
                format!("replaces a block at {}", previous.address().fmt_short()),
            ));
        }

        match (self, previous) {
            (Block::Mutable(block), Block::Mutable(previous)) => block.validate_against(previous),
            (Block::Acl(block), Block::Acl(previous)) => block.validate_against(previous),
            (Block::Immutable(_), Block::Immutable(_)) | (Block::User(_), Block::User(_)) => {
                self.validate()?;
                if self != previous {
                    return Err(QuireError::invalid(
                        self.address(),
                        "immutable content differs from stored block",
                    ));
                }
                Ok(())
            }
            _ => Err(QuireError::invalid(
                self.address(),
                format!(
                    "{:?} block cannot replace a {:?} block",
                    self.kind(),
                    previous.kind()
                ),
            )),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_strictly_increases_version() {
        let keys = KeyPair::generate();
        let mut block = Block::mutable(&keys.public());
        block.set_data(Bytes::from_static(b"data")).unwrap();
        let mut last = block.version().unwrap();
        for _ in 0..3 {
            block.seal(&keys).unwrap();
            let version = block.version().unwrap();
            assert!(version > last);
            assert!(block.is_valid());
            last = version;
        }
    }

    #[test]
    fn test_newer_validates_against_older_only() {
        let keys = KeyPair::generate();
        let mut older = Block::acl(&keys.public());
        older.set_data(Bytes::from_static(b"one")).unwrap();
        older.seal(&keys).unwrap();

        let mut newer = older.clone();
        newer.set_data(Bytes::from_static(b"two")).unwrap();
        newer.seal(&keys).unwrap();

        assert!(newer.validate_against(&older).is_ok());
        assert!(older.validate_against(&newer).is_err());
    }

    #[test]
    fn test_kind_change_is_rejected() {
        let keys = KeyPair::generate();
        let mut okb = Block::mutable(&keys.public());
        okb.seal(&keys).unwrap();
        let other = Block::immutable(Bytes::from_static(b"x"));
        assert!(okb.validate_against(&other).is_err());
    }

    #[test]
    fn test_immutable_cannot_be_modified() {
        let mut block = Block::immutable(Bytes::from_static(b"x"));
        assert!(block.set_data(Bytes::from_static(b"y")).is_err());
    }

    #[test]
    fn test_decoded_block_still_validates() {
        let keys = KeyPair::generate();
        let mut block = Block::acl(&keys.public());
        block
            .as_acl_mut()
            .unwrap()
            .set_permissions(&KeyPair::generate().public(), true, false)
            .unwrap();
        block.set_data(Bytes::from_static(b"payload")).unwrap();
        block.seal(&keys).unwrap();

        let decoded = Block::decode(&block.encode().unwrap()).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.is_valid());
    }
}
