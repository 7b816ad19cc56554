use crate::address::Address;
use crate::transport::Endpoints;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

pub type PeerInfos = BTreeMap<Address, PeerInfo>;

const UNSTAMPED: i64 = -1;

/// What a node knows about how to reach another node.
///
/// Stamped endpoints come from the node itself and are replaced wholesale
/// by a more recent stamp; unstamped endpoints were observed by third
/// parties and only ever accumulate. Merging is therefore idempotent and
/// order-independent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(default)]
    pub endpoints_stamped: Endpoints,
    #[serde(default)]
    pub endpoints_unstamped: Endpoints,
    /// Milliseconds since the epoch at which the stamped endpoints were
    /// published.
    #[serde(default = "unstamped")]
    pub stamp: i64,
    #[serde(skip, default = "Instant::now")]
    pub last_seen: Instant,
    #[serde(skip, default = "Instant::now")]
    pub last_contact_attempt: Instant,
}

fn unstamped() -> i64 {
    UNSTAMPED
}

impl PeerInfo {
    /// Endpoints published by the node itself, stamped now.
    pub fn stamped(endpoints: Endpoints) -> Self {
        Self::with_stamp(endpoints, chrono::Utc::now().timestamp_millis())
    }

    pub fn with_stamp(endpoints: Endpoints, stamp: i64) -> Self {
        let now = Instant::now();
        Self {
            endpoints_stamped: endpoints,
            endpoints_unstamped: Endpoints::new(),
            stamp,
            last_seen: now,
            last_contact_attempt: now,
        }
    }

    /// Endpoints learned second-hand.
    pub fn unstamped(endpoints: Endpoints) -> Self {
        let now = Instant::now();
        Self {
            endpoints_stamped: Endpoints::new(),
            endpoints_unstamped: endpoints,
            stamp: UNSTAMPED,
            last_seen: now,
            last_contact_attempt: now,
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        let mut endpoints = self.endpoints_stamped.clone();
        endpoints.merge(&self.endpoints_unstamped);
        endpoints
    }

    /// Returns whether anything changed.
    pub fn merge(&mut self, from: &PeerInfo) -> bool {
        let mut changed = false;
        if self.stamp < from.stamp {
            self.endpoints_stamped = from.endpoints_stamped.clone();
            self.stamp = from.stamp;
            changed = true;
        }
        if self.endpoints_unstamped.merge(&from.endpoints_unstamped) {
            changed = true;
        }
        changed
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.stamp == other.stamp
            && self.endpoints_stamped == other.endpoints_stamped
            && self.endpoints_unstamped == other.endpoints_unstamped
    }
}

impl Eq for PeerInfo {}
