//! Gossip overlay.
//!
//! Every node keeps a full membership table ([`PeerInfos`]) and an address
//! book mapping block addresses to the nodes holding them. Both are
//! maintained by exchanging tables with each newly connected peer and by
//! pushing incremental updates to the peers connected to us. Placement of
//! new blocks is random; lookups consult the address book and fall back to
//! asking every connected peer.

mod address_book;
mod loops;
mod peer_info;
mod peers;

pub use address_book::AddressBook;
pub use peer_info::{PeerInfo, PeerInfos};

use self::peers::PeerSet;
use super::Overlay;
use crate::address::Address;
use crate::config::KouncilConfig;
use crate::dock::{Dock, NodeLocation, PeerDirectory};
use crate::error::{QuireError, Result};
use crate::peer::{LocalPeer, Member, Peer, RemotePeer};
use crate::rpc::{Envelope, Request, Response};
use crate::transport::{Channel, Endpoints, Service};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

#[derive(Default)]
struct KouncilState {
    address_book: AddressBook,
    peers: PeerSet,
    infos: PeerInfos,
    // Nodes we already exchanged tables with.
    advertised: HashSet<Address>,
}

pub struct Kouncil {
    me: Weak<Kouncil>,
    local: Arc<LocalPeer>,
    dock: Arc<Dock>,
    config: KouncilConfig,
    state: Mutex<KouncilState>,
    new_entries: mpsc::UnboundedSender<Address>,
    tasks: std::sync::Mutex<JoinSet<()>>,
    stopped: AtomicBool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KouncilStats {
    pub id: Address,
    pub peers: Vec<PeerStats>,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStats {
    pub id: Address,
    pub endpoints: Endpoints,
    pub connected: bool,
}

impl Kouncil {
    pub async fn new(
        local: Arc<LocalPeer>,
        dock: Arc<Dock>,
        config: KouncilConfig,
    ) -> Result<Arc<Self>> {
        let id = local.node_id();
        let mut state = KouncilState::default();
        state
            .infos
            .insert(id, PeerInfo::stamped(local.endpoints().clone()));
        state
            .peers
            .insert_connected(id, Member::Local(local.clone()));
        for address in local.addresses().await? {
            state.address_book.insert(id, address);
        }
        tracing::debug!(
            "{}: loaded {} entries from storage",
            id.fmt_short(),
            state.address_book.len()
        );

        // Subscribe before anything can be stored through us.
        let local_events = local.subscribe();
        let (new_entries, entries_rx) = mpsc::unbounded_channel();
        let kouncil = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            local,
            dock,
            config,
            state: Mutex::new(state),
            new_entries,
            tasks: std::sync::Mutex::new(JoinSet::new()),
            stopped: AtomicBool::new(false),
        });

        let service: Arc<dyn Service> = kouncil.clone();
        kouncil.local.set_overlay(Arc::downgrade(&service));
        let directory: Arc<dyn PeerDirectory> = kouncil.clone();
        kouncil.dock.attach(Arc::downgrade(&directory));

        let me = kouncil.me.clone();
        kouncil.perform("dispatch", loops::dispatch(me.clone(), local_events));
        kouncil.perform(
            "broadcast",
            loops::broadcast(me.clone(), entries_rx, kouncil.config.broadcast_batch),
        );
        kouncil.perform(
            "watch",
            loops::watch(me, kouncil.config.watcher_interval(), kouncil.config.contact_ceiling()),
        );

        tracing::info!("{}: kouncil started", id.fmt_short());
        Ok(kouncil)
    }

    pub fn local(&self) -> &Arc<LocalPeer> {
        &self.local
    }

    /// Contact seed nodes whose identity is not known yet.
    pub fn bootstrap(&self, seeds: Vec<Endpoints>) {
        for endpoints in seeds {
            if endpoints.is_empty() {
                continue;
            }
            let Some(kouncil) = self.me.upgrade() else {
                return;
            };
            self.perform("bootstrap", async move {
                kouncil.discover_anonymous(endpoints).await;
            });
        }
    }

    pub async fn stats(&self) -> KouncilStats {
        let state = self.state.lock().await;
        let peers = state
            .peers
            .remotes()
            .map(|(id, remote, connected)| PeerStats {
                id: *id,
                endpoints: remote.endpoints(),
                connected,
            })
            .collect();
        KouncilStats {
            id: self.id(),
            peers,
            entries: state.address_book.len(),
        }
    }

    /// Nodes the address book says hold `address`.
    pub async fn holders(&self, address: &Address) -> BTreeSet<Address> {
        self.state.lock().await.address_book.holders(address)
    }

    pub async fn connected_peers(&self) -> BTreeSet<Address> {
        let state = self.state.lock().await;
        state
            .peers
            .remotes()
            .filter(|(_, _, connected)| *connected)
            .map(|(id, _, _)| *id)
            .collect()
    }

    pub async fn infos(&self) -> PeerInfos {
        self.state.lock().await.infos.clone()
    }

    fn perform<F>(&self, name: &'static str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.stopped.load(Ordering::SeqCst) {
            tracing::trace!("{}: not starting {} after shutdown", self.id().fmt_short(), name);
            return;
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            while tasks.try_join_next().is_some() {}
            tasks.spawn(job);
        }
    }

    async fn record_local(&self, address: Address, stored: bool) {
        let id = self.id();
        let mut state = self.state.lock().await;
        if stored {
            state.address_book.insert(id, address);
            drop(state);
            let _ = self.new_entries.send(address);
        } else {
            state.address_book.remove(&id, &address);
        }
    }

    /// Handle a batch of peer infos from gossip.
    ///
    /// Boxed because connecting to a newly learned peer leads back here
    /// once that peer answers our advertisement.
    fn discover_infos(&self, infos: PeerInfos) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let id = self.id();
            let mut to_connect = Vec::new();
            let mut to_notify = Vec::new();
            {
                let mut state = self.state.lock().await;
                for (peer, info) in infos {
                    if peer == id {
                        continue;
                    }
                    if peer.is_null() {
                        to_connect.push((None, info));
                        continue;
                    }
                    match state.infos.get_mut(&peer) {
                        None => {
                            tracing::trace!("{}: learned of {}", id.fmt_short(), peer.fmt_short());
                            state.infos.insert(peer, info.clone());
                            to_connect.push((Some(peer), info));
                        }
                        Some(known) => {
                            if known.merge(&info) {
                                to_notify.push((peer, known.clone()));
                            }
                        }
                    }
                }
            }

            let Some(kouncil) = self.me.upgrade() else {
                return;
            };
            for (peer, info) in to_connect {
                let kouncil = kouncil.clone();
                match peer {
                    Some(peer) => self.perform("connect", async move {
                        kouncil.discover_peer(peer, info).await;
                    }),
                    None => self.perform("connect", async move {
                        kouncil.discover_anonymous(info.endpoints()).await;
                    }),
                }
            }
            for (peer, info) in to_notify {
                let kouncil = kouncil.clone();
                self.perform("notify observers", async move {
                    kouncil.notify_observers(peer, info).await;
                });
            }
        })
    }

    async fn notify_observers(&self, peer: Address, info: PeerInfo) {
        tracing::debug!("{}: notifying observers of {}", self.id().fmt_short(), peer.fmt_short());
        let infos = PeerInfos::from([(peer, info)]);
        self.local.broadcast(Request::KouncilDiscover { infos }).await;
    }

    async fn discover_anonymous(&self, endpoints: Endpoints) {
        let member = match self.dock.make_peer(&NodeLocation::anonymous(endpoints.clone())).await {
            Ok(member) => member,
            Err(error) => {
                tracing::debug!("{}: unable to reach {}: {}", self.id().fmt_short(), endpoints, error);
                return;
            }
        };
        let Member::Remote(remote) = member else {
            return;
        };
        let Some(peer) = remote.id() else {
            return;
        };

        {
            let mut state = self.state.lock().await;
            match state.infos.get_mut(&peer) {
                Some(known) => {
                    tracing::debug!(
                        "{}: anonymous connect gave us known peer {}",
                        self.id().fmt_short(),
                        peer.fmt_short()
                    );
                    known.merge(&PeerInfo::unstamped(endpoints));
                }
                None => {
                    state.infos.insert(peer, PeerInfo::unstamped(endpoints));
                }
            }
        }
        self.track(peer, remote).await;
    }

    async fn discover_peer(&self, peer: Address, info: PeerInfo) {
        let location = NodeLocation::new(peer, info.endpoints());
        match self.dock.make_peer(&location).await {
            Ok(Member::Remote(remote)) => self.track(peer, remote).await,
            Ok(Member::Local(_)) => {}
            Err(error) => {
                tracing::debug!(
                    "{}: unable to build peer {}: {}",
                    self.id().fmt_short(),
                    peer.fmt_short(),
                    error
                );
            }
        }
    }

    /// Start following `remote`'s connection events and connect to it.
    async fn track(&self, peer: Address, remote: Arc<RemotePeer>) {
        {
            let mut state = self.state.lock().await;
            if state.peers.contains(&peer) {
                return;
            }
            state
                .peers
                .insert_disconnected(peer, Member::Remote(remote.clone()));
            if let Some(info) = state.infos.get_mut(&peer) {
                info.last_seen = Instant::now();
                info.last_contact_attempt = info.last_seen;
            }
        }
        tracing::debug!("{}: discovered {}", self.id().fmt_short(), peer.fmt_short());

        let events = remote.subscribe();
        self.perform(
            "peer events",
            loops::follow(self.me.clone(), Arc::downgrade(&remote), events),
        );

        if remote.is_connected() {
            self.peer_connected(&remote).await;
        } else if let Err(error) = remote.connect().await {
            // Left disconnected; the watcher will try again.
            tracing::debug!(
                "{}: unable to connect to {}: {}",
                self.id().fmt_short(),
                peer.fmt_short(),
                error
            );
        }
    }

    async fn peer_connected(&self, remote: &Arc<RemotePeer>) {
        let (peer, advertise) = {
            let mut state = self.state.lock().await;
            let Some(peer) = state.peers.tracks(remote) else {
                return;
            };
            if !state.peers.mark_connected(&peer) {
                return;
            }
            if let Some(info) = state.infos.get_mut(&peer) {
                info.last_seen = Instant::now();
            }
            (peer, state.advertised.insert(peer))
        };
        tracing::debug!("{}: peer {} connected", self.id().fmt_short(), peer.fmt_short());

        match remote.fetch_entries().await {
            Ok(entries) => {
                let mut state = self.state.lock().await;
                if state.peers.is_connected(&peer) {
                    for address in &entries {
                        state.address_book.insert(peer, *address);
                    }
                    tracing::debug!(
                        "{}: added {} entries from {}",
                        self.id().fmt_short(),
                        entries.len(),
                        peer.fmt_short()
                    );
                }
            }
            Err(error) => {
                tracing::debug!(
                    "{}: unable to fetch entries of {}: {}",
                    self.id().fmt_short(),
                    peer.fmt_short(),
                    error
                );
            }
        }

        if !advertise {
            return;
        }

        let (ours, info) = {
            let state = self.state.lock().await;
            (state.infos.clone(), state.infos.get(&peer).cloned())
        };
        if let Some(info) = info {
            self.notify_observers(peer, info).await;
        }
        match remote.advertise(ours).await {
            Ok(theirs) => {
                tracing::trace!(
                    "{}: fetched {} peers from {}",
                    self.id().fmt_short(),
                    theirs.len(),
                    peer.fmt_short()
                );
                self.discover_infos(theirs).await;
            }
            Err(error) => {
                // A disconnection event follows if the link is gone.
                tracing::trace!(
                    "{}: unable to advertise to {}: {}",
                    self.id().fmt_short(),
                    peer.fmt_short(),
                    error
                );
                self.state.lock().await.advertised.remove(&peer);
            }
        }
    }

    async fn peer_disconnected(&self, remote: &Arc<RemotePeer>) {
        let mut state = self.state.lock().await;
        let Some(peer) = state.peers.tracks(remote) else {
            return;
        };
        if !state.peers.mark_disconnected(&peer) {
            return;
        }
        if let Some(info) = state.infos.get_mut(&peer) {
            info.last_seen = Instant::now();
            info.last_contact_attempt = info.last_seen;
        }
        let purged = state.address_book.remove_node(&peer);
        tracing::debug!(
            "{}: peer {} disconnected, forgot {} entries",
            self.id().fmt_short(),
            peer.fmt_short(),
            purged
        );
    }

    async fn lookup_remotes(
        &self,
        address: &Address,
        n: usize,
        remotes: Vec<Arc<RemotePeer>>,
    ) -> Vec<Member> {
        let mut found = Vec::new();
        for remote in remotes {
            let nodes = match remote.lookup(address).await {
                Ok(nodes) => nodes,
                Err(error) => {
                    tracing::debug!("skipping peer with network issue: {}", error);
                    continue;
                }
            };
            for node in nodes {
                match self.lookup_node(&node).await {
                    Ok(member) => {
                        tracing::debug!(
                            "peer says node {} holds block {}",
                            node.fmt_short(),
                            address.fmt_short()
                        );
                        found.push(member);
                        if found.len() >= n {
                            break;
                        }
                    }
                    Err(_) => {
                        tracing::warn!(
                            "node {} is said to hold block {} but is unknown to us",
                            node.fmt_short(),
                            address.fmt_short()
                        );
                    }
                }
            }
            if !found.is_empty() {
                break;
            }
        }
        found
    }

    async fn serve_overlay(&self, envelope: Envelope) -> Result<Response> {
        let id = self.id();
        match envelope.request {
            Request::KouncilFetchEntries => Ok(Response::Entries {
                entries: self.state.lock().await.address_book.blocks_of(&id),
            }),
            Request::KouncilLookup { address } => Ok(Response::Nodes {
                nodes: self.state.lock().await.address_book.holders(&address),
            }),
            Request::KouncilAdvertise { infos } => {
                self.discover_infos(infos).await;
                Ok(Response::PeerInfos {
                    infos: self.infos().await,
                })
            }
            Request::KouncilDiscover { infos } => {
                self.discover_infos(infos).await;
                Ok(Response::Done)
            }
            Request::KouncilAddEntries { entries } => {
                let sender = envelope.sender.ok_or_else(|| {
                    QuireError::Internal("entries pushed by an anonymous node".to_string())
                })?;
                let mut state = self.state.lock().await;
                if state.peers.is_connected(&sender) {
                    for address in &entries {
                        state.address_book.insert(sender, *address);
                    }
                    tracing::trace!(
                        "{}: added {} entries from {}",
                        id.fmt_short(),
                        entries.len(),
                        sender.fmt_short()
                    );
                }
                Ok(Response::Done)
            }
            request => Err(QuireError::Internal(format!(
                "kouncil cannot serve {}",
                request.method()
            ))),
        }
    }
}

/// Pick `count` distinct indices out of `0..size`, uniformly.
pub(crate) fn pick_n<R: Rng>(rng: &mut R, size: usize, count: usize) -> Vec<usize> {
    let mut picked: Vec<usize> = Vec::with_capacity(count);
    while picked.len() < count.min(size) {
        let mut value = rng.gen_range(0..size - picked.len());
        for taken in &picked {
            if value >= *taken {
                value += 1;
            }
        }
        picked.push(value);
        picked.sort_unstable();
    }
    picked
}

#[async_trait]
impl Service for Kouncil {
    async fn serve(&self, envelope: Envelope, _back: Option<Arc<dyn Channel>>) -> Response {
        Response::from_result(self.serve_overlay(envelope).await)
    }
}

#[async_trait]
impl PeerDirectory for Kouncil {
    async fn endpoints(&self, id: &Address) -> Option<Endpoints> {
        let state = self.state.lock().await;
        let endpoints = state.infos.get(id)?.endpoints();
        tracing::debug!("updating endpoints for {} with {} entries", id.fmt_short(), endpoints.len());
        Some(endpoints)
    }
}

#[async_trait]
impl Overlay for Kouncil {
    fn id(&self) -> Address {
        self.local.node_id()
    }

    async fn allocate(&self, address: &Address, n: usize) -> Result<Vec<Member>> {
        let members = self.state.lock().await.peers.connected_members();
        tracing::debug!(
            "{}: selecting {} nodes from {} peers for {}",
            self.id().fmt_short(),
            n,
            members.len(),
            address.fmt_short()
        );
        if n >= members.len() {
            return Ok(members);
        }
        let indices = pick_n(&mut rand::thread_rng(), members.len(), n);
        Ok(indices
            .into_iter()
            .map(|index| members[index].clone())
            .collect())
    }

    async fn lookup(&self, address: &Address, n: usize) -> Result<Vec<Member>> {
        let remotes = {
            let state = self.state.lock().await;
            let mut found = Vec::new();
            for node in state.address_book.holders(address) {
                match state.peers.get(&node) {
                    Some(member) => found.push(member.clone()),
                    None => tracing::warn!(
                        "node {} holds {} but is not a peer",
                        node.fmt_short(),
                        address.fmt_short()
                    ),
                }
                if found.len() >= n {
                    break;
                }
            }
            if !found.is_empty() {
                return Ok(found);
            }
            state.peers.connected_remotes()
        };

        tracing::trace!(
            "{}: block {} not found, checking all {} peers",
            self.id().fmt_short(),
            address.fmt_short(),
            remotes.len()
        );
        Ok(self.lookup_remotes(address, n, remotes).await)
    }

    async fn lookup_node(&self, id: &Address) -> Result<Member> {
        let state = self.state.lock().await;
        if let Some(member) = state.peers.connected(id) {
            return Ok(member.clone());
        }
        if let Some(member) = state.peers.get(id) {
            tracing::debug!("{}: node {} found in disconnected peers", self.id().fmt_short(), id.fmt_short());
            return Ok(member.clone());
        }
        Err(QuireError::NodeNotFound(*id))
    }

    async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.local.clear_overlay();

        let mut tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        let members = self.state.lock().await.peers.clear();
        for member in members {
            if let Member::Remote(remote) = member {
                remote.disconnect().await;
            }
        }
        tracing::info!("{}: kouncil stopped", self.id().fmt_short());
    }
}
