//! Quire Core - peer-to-peer block store with gossip membership
//!
//! A leaderless, content- and identity-addressed block store using:
//! - self-validating immutable, owner-keyed, ACL and user blocks
//! - Ed25519 signatures and SHA256 addresses
//! - gossip-maintained membership and address book (kouncil)
//! - quorum replication over a pluggable peer transport

pub mod address;
pub mod block;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod dock;
pub mod doughnut;
pub mod error;
pub mod node;
pub mod overlay;
pub mod peer;
pub mod rpc;
pub mod storage;
pub mod transport;

mod encoding;

pub use address::Address;
pub use block::{
    AclBlock, AclConflictResolver, AclEntry, Block, BlockKind, ConflictResolver, ImmutableBlock,
    OwnerKeyedBlock, ResolverChain, UserBlock,
};
pub use config::{
    DockConfig, KouncilConfig, NodeConfig, OverlayConfig, ReplicationConfig, StorageConfig,
};
pub use consensus::{Consensus, QuorumConsensus};
pub use crypto::{KeyPair, PublicKey, Signature};
pub use dock::{Dock, NodeLocation, PeerDirectory};
pub use doughnut::{Doughnut, User};
pub use error::{ErrorKind, QuireError, RemoteError, Result};
pub use node::{Node, NodeBuilder};
pub use overlay::{Kouncil, KouncilStats, Overlay, PeerInfo, PeerInfos, Stonehenge};
pub use peer::{LocalEvent, LocalPeer, Member, Peer, PeerEvent, RemotePeer, StoreMode};
pub use rpc::{Envelope, Request, Response};
pub use storage::{FilesystemStorage, MemoryStorage, Storage};
pub use transport::{
    Channel, Endpoint, Endpoints, HttpTransport, MemoryNetwork, Service, Transport,
};
