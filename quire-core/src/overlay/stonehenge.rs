use super::Overlay;
use crate::address::Address;
use crate::dock::{Dock, NodeLocation};
use crate::error::{QuireError, Result};
use crate::peer::Member;
use async_trait::async_trait;
use std::sync::Arc;

/// Fixed membership: every node is configured with the same list and
/// blocks go to the first members that answer.
pub struct Stonehenge {
    dock: Arc<Dock>,
    members: Vec<NodeLocation>,
}

impl Stonehenge {
    pub fn new(dock: Arc<Dock>, members: Vec<NodeLocation>) -> Result<Self> {
        if let Some(anonymous) = members.iter().find(|member| member.id.is_none()) {
            return Err(QuireError::Config(format!(
                "stonehenge member at {} has no id",
                anonymous.endpoints
            )));
        }
        Ok(Self { dock, members })
    }

    pub fn members(&self) -> &[NodeLocation] {
        &self.members
    }

    async fn first(&self, n: usize) -> Vec<Member> {
        let mut found = Vec::new();
        for location in &self.members {
            if found.len() >= n {
                break;
            }
            match self.dock.make_peer(location).await {
                Ok(member) => found.push(member),
                Err(error) => {
                    tracing::debug!("skipping member at {}: {}", location.endpoints, error);
                }
            }
        }
        found
    }
}

#[async_trait]
impl Overlay for Stonehenge {
    fn id(&self) -> Address {
        self.dock.id()
    }

    async fn allocate(&self, _address: &Address, n: usize) -> Result<Vec<Member>> {
        Ok(self.first(n).await)
    }

    async fn lookup(&self, _address: &Address, n: usize) -> Result<Vec<Member>> {
        Ok(self.first(n).await)
    }

    async fn lookup_node(&self, id: &Address) -> Result<Member> {
        let location = self
            .members
            .iter()
            .find(|member| member.id == Some(*id))
            .ok_or(QuireError::NodeNotFound(*id))?;
        self.dock.make_peer(location).await
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DockConfig;
    use crate::peer::{LocalPeer, Peer};
    use crate::storage::MemoryStorage;
    use crate::transport::{Endpoint, Endpoints, MemoryNetwork};

    #[tokio::test]
    async fn test_members_in_list_order() {
        let network = MemoryNetwork::new();
        let local = LocalPeer::new(
            Address::random(),
            ["a"].into_iter().collect(),
            Arc::new(MemoryStorage::new()),
        );
        network.listen(Endpoint::from("a"), local.clone()).await;
        let dock = Dock::new(
            local.clone(),
            Arc::new(network.transport(Some(Endpoint::from("a")))),
            DockConfig::default(),
        );

        let other = Address::random();
        let members = vec![
            NodeLocation::new(local.node_id(), ["a"].into_iter().collect()),
            NodeLocation::new(other, ["b"].into_iter().collect()),
        ];
        let overlay = Stonehenge::new(dock, members).unwrap();

        let picked = overlay.allocate(&Address::hash(b"x"), 1).await.unwrap();
        assert_eq!(picked.len(), 1);
        assert!(picked[0].is_local());

        let all = overlay.lookup(&Address::hash(b"x"), 5).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].id(), Some(other));

        assert!(matches!(
            overlay.lookup_node(&Address::hash(b"nobody")).await,
            Err(QuireError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_anonymous_members_are_rejected() {
        let network = MemoryNetwork::new();
        let local = LocalPeer::new(Address::random(), Endpoints::new(), Arc::new(MemoryStorage::new()));
        let dock = Dock::new(local, Arc::new(network.transport(None)), DockConfig::default());
        let members = vec![NodeLocation::anonymous(["b"].into_iter().collect())];
        assert!(Stonehenge::new(dock, members).is_err());
    }
}
