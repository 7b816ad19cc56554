use crate::address::Address;
use crate::peer::{Member, RemotePeer};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Known peers, split by liveness. Remote peers are also indexed by their
/// serial so that events from a replaced peer object can be told apart.
#[derive(Default)]
pub(super) struct PeerSet {
    connected: BTreeMap<Address, Member>,
    disconnected: BTreeMap<Address, Member>,
    serials: HashMap<u64, Address>,
}

impl PeerSet {
    pub fn insert_connected(&mut self, id: Address, member: Member) {
        self.index(id, &member);
        self.disconnected.remove(&id);
        self.connected.insert(id, member);
    }

    pub fn insert_disconnected(&mut self, id: Address, member: Member) {
        self.index(id, &member);
        self.connected.remove(&id);
        self.disconnected.insert(id, member);
    }

    fn index(&mut self, id: Address, member: &Member) {
        if let Some(replaced) = self.get(&id).and_then(Member::as_remote) {
            let serial = replaced.serial();
            self.serials.remove(&serial);
        }
        if let Some(remote) = member.as_remote() {
            self.serials.insert(remote.serial(), id);
        }
    }

    pub fn contains(&self, id: &Address) -> bool {
        self.connected.contains_key(id) || self.disconnected.contains_key(id)
    }

    pub fn is_connected(&self, id: &Address) -> bool {
        self.connected.contains_key(id)
    }

    pub fn get(&self, id: &Address) -> Option<&Member> {
        self.connected.get(id).or_else(|| self.disconnected.get(id))
    }

    pub fn connected(&self, id: &Address) -> Option<&Member> {
        self.connected.get(id)
    }

    /// Whether `remote` is the peer object we track for its node.
    pub fn tracks(&self, remote: &RemotePeer) -> Option<Address> {
        let id = self.serials.get(&remote.serial()).copied()?;
        match self.get(&id).and_then(Member::as_remote) {
            Some(tracked) if tracked.serial() == remote.serial() => Some(id),
            _ => None,
        }
    }

    pub fn mark_connected(&mut self, id: &Address) -> bool {
        match self.disconnected.remove(id) {
            Some(member) => {
                self.connected.insert(*id, member);
                true
            }
            None => false,
        }
    }

    pub fn mark_disconnected(&mut self, id: &Address) -> bool {
        match self.connected.remove(id) {
            Some(member) => {
                self.disconnected.insert(*id, member);
                true
            }
            None => false,
        }
    }

    pub fn connected_members(&self) -> Vec<Member> {
        self.connected.values().cloned().collect()
    }

    pub fn connected_remotes(&self) -> Vec<Arc<RemotePeer>> {
        self.connected
            .values()
            .filter_map(|member| member.as_remote().cloned())
            .collect()
    }

    pub fn disconnected_remotes(&self) -> impl Iterator<Item = (&Address, &Arc<RemotePeer>)> {
        self.disconnected
            .iter()
            .filter_map(|(id, member)| member.as_remote().map(|remote| (id, remote)))
    }

    /// Every remote peer with its liveness.
    pub fn remotes(&self) -> impl Iterator<Item = (&Address, &Arc<RemotePeer>, bool)> {
        let connected = self
            .connected
            .iter()
            .filter_map(|(id, member)| member.as_remote().map(|remote| (id, remote, true)));
        let disconnected = self
            .disconnected_remotes()
            .map(|(id, remote)| (id, remote, false));
        connected.chain(disconnected)
    }

    pub fn clear(&mut self) -> Vec<Member> {
        self.serials.clear();
        let mut members: Vec<Member> = std::mem::take(&mut self.connected).into_values().collect();
        members.extend(std::mem::take(&mut self.disconnected).into_values());
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DockConfig;
    use crate::dock::{Dock, NodeLocation};
    use crate::peer::LocalPeer;
    use crate::storage::MemoryStorage;
    use crate::transport::{Endpoints, MemoryNetwork};

    async fn remote(dock: &Dock, id: Address) -> Arc<RemotePeer> {
        let location = NodeLocation::new(id, ["elsewhere"].into_iter().collect());
        match dock.make_peer(&location).await.unwrap() {
            Member::Remote(remote) => remote,
            Member::Local(_) => panic!("expected a remote peer"),
        }
    }

    #[tokio::test]
    async fn test_replaced_peer_is_no_longer_tracked() {
        let local = LocalPeer::new(Address::random(), Endpoints::new(), Arc::new(MemoryStorage::new()));
        let config = DockConfig {
            disable_peer_cache: true,
            ..DockConfig::default()
        };
        let dock = Dock::new(local, Arc::new(MemoryNetwork::new().transport(None)), config);

        let id = Address::random();
        let first = remote(&dock, id).await;
        let second = remote(&dock, id).await;
        assert_ne!(first.serial(), second.serial());

        let mut peers = PeerSet::default();
        peers.insert_disconnected(id, Member::Remote(first.clone()));
        assert_eq!(peers.tracks(&first), Some(id));

        peers.insert_connected(id, Member::Remote(second.clone()));
        assert_eq!(peers.tracks(&first), None);
        assert_eq!(peers.tracks(&second), Some(id));
        assert_eq!(peers.serials.len(), 1);

        assert_eq!(peers.clear().len(), 1);
        assert!(peers.serials.is_empty());
    }
}
