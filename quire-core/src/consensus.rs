//! Replication policy on top of an overlay.

use crate::address::Address;
use crate::block::Block;
use crate::config::ReplicationConfig;
use crate::error::{QuireError, Result};
use crate::overlay::Overlay;
use crate::peer::{Member, Peer, StoreMode};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;

#[async_trait]
pub trait Consensus: Send + Sync {
    async fn store(&self, block: &Block, mode: StoreMode) -> Result<()>;

    async fn fetch(&self, address: &Address) -> Result<Block>;

    async fn remove(&self, address: &Address) -> Result<()>;
}

/// Writes to `factor` peers and succeeds once `write_quorum` acknowledge;
/// reads return the first holder's block that validates.
pub struct QuorumConsensus {
    overlay: Arc<dyn Overlay>,
    replication: ReplicationConfig,
}

#[derive(Debug, Default)]
struct StoreOutcome {
    acknowledged: usize,
    network_failures: usize,
    conflict: Option<Block>,
    rejection: Option<QuireError>,
}

impl StoreOutcome {
    fn record(&mut self, peer: &Member, result: Result<()>) {
        match result {
            Ok(()) => self.acknowledged += 1,
            Err(QuireError::Conflict { current, .. }) => {
                let newer = match &self.conflict {
                    Some(kept) => current.version() > kept.version(),
                    None => true,
                };
                if newer {
                    self.conflict = Some(*current);
                }
            }
            Err(error) if error.is_network() => {
                tracing::warn!("store on {:?} failed: {}", peer, error);
                self.network_failures += 1;
            }
            Err(error) => {
                tracing::debug!("store rejected by {:?}: {}", peer, error);
                self.rejection.get_or_insert(error);
            }
        }
    }
}

impl QuorumConsensus {
    pub fn new(overlay: Arc<dyn Overlay>, replication: ReplicationConfig) -> Self {
        Self {
            overlay,
            replication,
        }
    }

    pub fn replication(&self) -> &ReplicationConfig {
        &self.replication
    }

    async fn placement(&self, address: &Address, mode: StoreMode) -> Result<Vec<Member>> {
        let factor = self.replication.factor;
        if mode == StoreMode::Update {
            let holders = self.overlay.lookup(address, factor).await?;
            if !holders.is_empty() {
                return Ok(holders);
            }
            tracing::debug!("no holder of {} found, allocating", address.fmt_short());
        }
        self.overlay.allocate(address, factor).await
    }
}

#[async_trait]
impl Consensus for QuorumConsensus {
    async fn store(&self, block: &Block, mode: StoreMode) -> Result<()> {
        let address = block.address();
        let targets = self.placement(&address, mode).await?;
        if targets.is_empty() {
            return Err(QuireError::NoPeers(format!("store {}", address)));
        }

        let results = join_all(targets.iter().map(|peer| peer.store(block, mode))).await;
        let mut outcome = StoreOutcome::default();
        for (peer, result) in targets.iter().zip(results) {
            outcome.record(peer, result);
        }

        let required = self.replication.write_quorum;
        if outcome.acknowledged >= required {
            tracing::trace!(
                "stored {} on {} of {} peers",
                address.fmt_short(),
                outcome.acknowledged,
                targets.len()
            );
            return Ok(());
        }
        if let Some(current) = outcome.conflict {
            return Err(QuireError::Conflict {
                address,
                current: Box::new(current),
            });
        }
        if outcome.acknowledged == 0 {
            if let Some(rejection) = outcome.rejection {
                return Err(rejection);
            }
        }
        tracing::warn!(
            "store of {} reached {} of {} required replicas ({} unreachable)",
            address.fmt_short(),
            outcome.acknowledged,
            required,
            outcome.network_failures
        );
        Err(QuireError::InsufficientReplicas {
            address,
            acknowledged: outcome.acknowledged,
            required,
        })
    }

    async fn fetch(&self, address: &Address) -> Result<Block> {
        let candidates = self.overlay.lookup(address, self.replication.factor).await?;
        if candidates.is_empty() {
            return Err(QuireError::MissingBlock(*address));
        }

        let mut network_failures = 0;
        let mut invalid = None;
        for peer in &candidates {
            match peer.fetch(address).await {
                Ok(block) => {
                    let checked = if block.address() == *address {
                        block.validate()
                    } else {
                        Err(QuireError::invalid(*address, "holder returned another block"))
                    };
                    match checked {
                        Ok(()) => return Ok(block),
                        Err(error) => {
                            tracing::warn!("discarding block from {:?}: {}", peer, error);
                            invalid = Some(error);
                        }
                    }
                }
                Err(QuireError::MissingBlock(_)) => {
                    tracing::debug!("{:?} does not hold {}", peer, address.fmt_short());
                }
                Err(error) if error.is_network() => {
                    tracing::debug!("fetch from {:?} failed: {}", peer, error);
                    network_failures += 1;
                }
                Err(error) => {
                    tracing::debug!("fetch from {:?} failed: {}", peer, error);
                }
            }
        }

        if let Some(invalid) = invalid {
            return Err(invalid);
        }
        if network_failures == candidates.len() {
            return Err(QuireError::Unavailable {
                address: *address,
                attempts: network_failures,
            });
        }
        Err(QuireError::MissingBlock(*address))
    }

    async fn remove(&self, address: &Address) -> Result<()> {
        let holders = self.overlay.lookup(address, self.replication.factor).await?;
        if holders.is_empty() {
            return Err(QuireError::MissingBlock(*address));
        }

        let results = join_all(holders.iter().map(|peer| peer.remove(address))).await;
        let mut removed = 0;
        let mut network_failures = 0;
        for (peer, result) in holders.iter().zip(results) {
            match result {
                Ok(()) => removed += 1,
                Err(error) => {
                    if error.is_network() {
                        network_failures += 1;
                    }
                    tracing::warn!("remove of {} on {:?} failed: {}", address.fmt_short(), peer, error);
                }
            }
        }

        if removed > 0 {
            return Ok(());
        }
        if network_failures == holders.len() {
            return Err(QuireError::Unavailable {
                address: *address,
                attempts: network_failures,
            });
        }
        Err(QuireError::MissingBlock(*address))
    }
}
