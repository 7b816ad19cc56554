use super::Block;
use crate::crypto::PublicKey;
use crate::error::{QuireError, Result};

/// Replays a local edit on top of the version that won a storage race.
pub trait ConflictResolver: Send + Sync {
    /// `attempted` is the block that failed to store, `current` the block
    /// that is stored. Returns the block to seal and store next.
    fn resolve(&self, attempted: &Block, current: Block) -> Result<Block>;

    fn description(&self) -> String;
}

/// Replays a single `set_permissions` call.
#[derive(Debug, Clone)]
pub struct AclConflictResolver {
    user: PublicKey,
    read: bool,
    write: bool,
}

impl AclConflictResolver {
    pub fn new(user: PublicKey, read: bool, write: bool) -> Self {
        Self { user, read, write }
    }
}

impl ConflictResolver for AclConflictResolver {
    fn resolve(&self, _attempted: &Block, mut current: Block) -> Result<Block> {
        let address = current.address();
        let acl = current
            .as_acl_mut()
            .ok_or_else(|| QuireError::invalid(address, "conflicting block is not an ACL block"))?;
        tracing::trace!(
            "replaying permissions for {} on {} version {}",
            self.user.fmt_short(),
            address.fmt_short(),
            acl.version()
        );
        acl.set_permissions(&self.user, self.read, self.write)?;
        Ok(current)
    }

    fn description(&self) -> String {
        format!(
            "set permissions of {} to read={} write={}",
            self.user.fmt_short(),
            self.read,
            self.write
        )
    }
}

/// Applies several resolvers in order.
#[derive(Default)]
pub struct ResolverChain {
    resolvers: Vec<Box<dyn ConflictResolver>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl ConflictResolver for ResolverChain {
    fn resolve(&self, attempted: &Block, current: Block) -> Result<Block> {
        self.resolvers
            .iter()
            .try_fold(current, |block, resolver| resolver.resolve(attempted, block))
    }

    fn description(&self) -> String {
        self.resolvers
            .iter()
            .map(|resolver| resolver.description())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
