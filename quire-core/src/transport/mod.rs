//! Connection providers.
//!
//! A [`Transport`] turns an endpoint set into a [`Channel`]; the core never
//! looks below that. Requests the remote side pushes back over the same
//! connection are handed to the `inbound` [`Service`] given at connect time.

pub mod http;
pub mod memory;

pub use http::{HttpEnvelope, HttpTransport};
pub use memory::{MemoryNetwork, MemoryTransport};

use crate::error::Result;
use crate::rpc::{Envelope, Response};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Endpoint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoints(BTreeSet<Endpoint>);

impl Endpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, endpoint: Endpoint) -> bool {
        self.0.insert(endpoint)
    }

    /// Union `other` into `self`, returning whether anything was added.
    pub fn merge(&mut self, other: &Endpoints) -> bool {
        let before = self.0.len();
        self.0.extend(other.0.iter().cloned());
        self.0.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(Endpoint::as_str)
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "[{}]", joined)
    }
}

impl FromIterator<Endpoint> for Endpoints {
    fn from_iter<I: IntoIterator<Item = Endpoint>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for Endpoints {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(Endpoint::from).collect())
    }
}

/// One established, authenticated connection.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn call(&self, envelope: Envelope) -> Result<Response>;

    /// Resolves once the channel can no longer carry calls.
    async fn closed(&self);

    fn is_closed(&self) -> bool;
}

/// Request handler on either end of a channel.
#[async_trait]
pub trait Service: Send + Sync {
    /// `back` reaches the caller over the same connection, when the
    /// transport supports it.
    async fn serve(&self, envelope: Envelope, back: Option<Arc<dyn Channel>>) -> Response;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        endpoints: &Endpoints,
        inbound: Arc<dyn Service>,
    ) -> Result<Arc<dyn Channel>>;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_merge_reports_change() {
        let mut endpoints: Endpoints = ["a:1", "b:2"].into_iter().collect();
        let other: Endpoints = ["b:2"].into_iter().collect();
        assert!(!endpoints.merge(&other));

        let other: Endpoints = ["c:3"].into_iter().collect();
        assert!(endpoints.merge(&other));
        assert_eq!(endpoints.len(), 3);
        assert_eq!(endpoints.to_string(), "[a:1,b:2,c:3]");
    }
}
