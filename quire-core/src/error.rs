use crate::address::Address;
use crate::block::Block;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuireError {
    #[error("Block not found: {0}")]
    MissingBlock(Address),

    #[error("Invalid block {address}: {reason}")]
    InvalidBlock { address: Address, reason: String },

    #[error("Conflict storing block {address}: a newer version is already stored")]
    Conflict {
        address: Address,
        current: Box<Block>,
    },

    #[error("Block already exists: {0}")]
    Collision(Address),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Node not found: {0}")]
    NodeNotFound(Address),

    #[error("No peers available to {0}")]
    NoPeers(String),

    #[error("Insufficient replicas for {address}: {acknowledged} of {required} acknowledged")]
    InsufficientReplicas {
        address: Address,
        acknowledged: usize,
        required: usize,
    },

    #[error("Block {address} unavailable: {attempts} holders unreachable")]
    Unavailable { address: Address, attempts: usize },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("User conflict: {0}")]
    UserConflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, QuireError>;

impl QuireError {
    pub fn invalid(address: Address, reason: impl Into<String>) -> Self {
        QuireError::InvalidBlock {
            address,
            reason: reason.into(),
        }
    }

    /// Transport-level failures that a caller may retry against another peer.
    pub fn is_network(&self) -> bool {
        matches!(self, QuireError::Network(_) | QuireError::Shutdown)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            QuireError::MissingBlock(_) => ErrorKind::MissingBlock,
            QuireError::InvalidBlock { .. } => ErrorKind::InvalidBlock,
            QuireError::Conflict { .. } => ErrorKind::Conflict,
            QuireError::Collision(_) => ErrorKind::Collision,
            QuireError::Network(_) | QuireError::Shutdown => ErrorKind::Network,
            QuireError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<reqwest::Error> for QuireError {
    fn from(error: reqwest::Error) -> Self {
        QuireError::Network(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingBlock,
    InvalidBlock,
    Conflict,
    Collision,
    Network,
    PermissionDenied,
    Internal,
}

/// Error as carried in an RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<Box<Block>>,
}

impl From<&QuireError> for RemoteError {
    fn from(error: &QuireError) -> Self {
        let (address, current) = match error {
            QuireError::MissingBlock(address) | QuireError::Collision(address) => {
                (Some(*address), None)
            }
            QuireError::InvalidBlock { address, .. } => (Some(*address), None),
            QuireError::Conflict { address, current } => (Some(*address), Some(current.clone())),
            _ => (None, None),
        };

        RemoteError {
            kind: error.kind(),
            message: error.to_string(),
            address,
            current,
        }
    }
}

impl From<RemoteError> for QuireError {
    fn from(error: RemoteError) -> Self {
        let address = error.address.unwrap_or_else(Address::null);
        match (error.kind, error.current) {
            (ErrorKind::MissingBlock, _) => QuireError::MissingBlock(address),
            (ErrorKind::InvalidBlock, _) => QuireError::invalid(address, error.message),
            (ErrorKind::Conflict, Some(current)) => QuireError::Conflict { address, current },
            (ErrorKind::Collision, _) => QuireError::Collision(address),
            (ErrorKind::Network, _) => QuireError::Network(error.message),
            (ErrorKind::PermissionDenied, _) => QuireError::PermissionDenied(error.message),
            _ => QuireError::Internal(error.message),
        }
    }
}
