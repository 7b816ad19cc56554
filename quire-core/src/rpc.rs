//! Messages exchanged between peers.
//!
//! Block traffic (`store`, `fetch`, `remove`) and the kouncil gossip
//! methods share one request/response vocabulary so that a single
//! authenticated channel carries both.

use crate::address::Address;
use crate::block::Block;
use crate::error::{QuireError, RemoteError, Result};
use crate::overlay::PeerInfos;
use crate::peer::StoreMode;
use crate::transport::Endpoints;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Option<Address>,
    pub request: Request,
}

impl Envelope {
    pub fn new(sender: Option<Address>, request: Request) -> Self {
        Self { sender, request }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// Handshake: announces the caller and learns the callee's id.
    Hello { id: Address, endpoints: Endpoints },
    Store { block: Block, mode: StoreMode },
    Fetch { address: Address },
    Remove { address: Address },
    /// All block addresses the callee holds.
    KouncilFetchEntries,
    /// Nodes the callee believes hold `address`.
    KouncilLookup { address: Address },
    /// Membership table exchange, once per new connection.
    KouncilAdvertise { infos: PeerInfos },
    /// Unsolicited push of newly learned peers.
    KouncilDiscover { infos: PeerInfos },
    /// Unsolicited push of addresses newly stored by the sender.
    KouncilAddEntries { entries: BTreeSet<Address> },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::Store { .. } => "store",
            Request::Fetch { .. } => "fetch",
            Request::Remove { .. } => "remove",
            Request::KouncilFetchEntries => "kouncil_fetch_entries",
            Request::KouncilLookup { .. } => "kouncil_lookup",
            Request::KouncilAdvertise { .. } => "kouncil_advertise",
            Request::KouncilDiscover { .. } => "kouncil_discover",
            Request::KouncilAddEntries { .. } => "kouncil_add_entries",
        }
    }

    pub fn is_overlay(&self) -> bool {
        self.method().starts_with("kouncil_")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Hello { id: Address },
    Done,
    Block { block: Block },
    Entries { entries: BTreeSet<Address> },
    Nodes { nodes: BTreeSet<Address> },
    PeerInfos { infos: PeerInfos },
    Error { error: RemoteError },
}

impl Response {
    pub fn error(error: &QuireError) -> Self {
        Response::Error {
            error: RemoteError::from(error),
        }
    }

    pub fn from_result(result: Result<Response>) -> Self {
        result.unwrap_or_else(|error| Response::error(&error))
    }

    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Error { error } => Err(error.into()),
            other => Ok(other),
        }
    }

    pub fn into_hello(self) -> Result<Address> {
        match self.into_result()? {
            Response::Hello { id } => Ok(id),
            other => Err(unexpected("hello", &other)),
        }
    }

    pub fn into_done(self) -> Result<()> {
        match self.into_result()? {
            Response::Done => Ok(()),
            other => Err(unexpected("done", &other)),
        }
    }

    pub fn into_block(self) -> Result<Block> {
        match self.into_result()? {
            Response::Block { block } => Ok(block),
            other => Err(unexpected("block", &other)),
        }
    }

    pub fn into_entries(self) -> Result<BTreeSet<Address>> {
        match self.into_result()? {
            Response::Entries { entries } => Ok(entries),
            other => Err(unexpected("entries", &other)),
        }
    }

    pub fn into_nodes(self) -> Result<BTreeSet<Address>> {
        match self.into_result()? {
            Response::Nodes { nodes } => Ok(nodes),
            other => Err(unexpected("nodes", &other)),
        }
    }

    pub fn into_peer_infos(self) -> Result<PeerInfos> {
        match self.into_result()? {
            Response::PeerInfos { infos } => Ok(infos),
            other => Err(unexpected("peer infos", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Response) -> QuireError {
    QuireError::Internal(format!("expected {} response, got {:?}", expected, got))
}
