//! Replication server peer sets.
//!
//! Peers are `host:port` strings. Host names are case-insensitive, so the
//! set keys on the lower-cased form while keeping the first spelling seen.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Format a replication server address.
pub fn peer_address(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

/// A case-insensitive, order-independent set of replication server addresses.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct PeerSet {
    peers: BTreeMap<String, String>,
}

impl PeerSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address. Returns true if it was not already present.
    pub fn insert(&mut self, address: impl Into<String>) -> bool {
        let address = address.into();
        let key = normalize(&address);
        if key.is_empty() || self.peers.contains_key(&key) {
            return false;
        }
        self.peers.insert(key, address.trim().to_string());
        true
    }

    /// Remove an address. Returns true if it was present.
    pub fn remove(&mut self, address: &str) -> bool {
        self.peers.remove(&normalize(address)).is_some()
    }

    /// Membership test ignoring case.
    pub fn contains(&self, address: &str) -> bool {
        self.peers.contains_key(&normalize(address))
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when there are no peers.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Iterate over the addresses as first spelled.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.peers.values().map(String::as_str)
    }

    /// Add every address of `other`.
    pub fn extend_from(&mut self, other: &PeerSet) {
        for address in other.iter() {
            self.insert(address);
        }
    }

    /// Set union of two peer sets.
    pub fn merge(&self, other: &PeerSet) -> PeerSet {
        let mut merged = self.clone();
        merged.extend_from(other);
        merged
    }

    /// True when the two sets share at least one address.
    pub fn intersects(&self, other: &PeerSet) -> bool {
        self.peers.keys().any(|k| other.peers.contains_key(k))
    }

    /// A copy without `address`.
    pub fn without(&self, address: &str) -> PeerSet {
        let mut copy = self.clone();
        copy.remove(address);
        copy
    }

    /// Addresses as attribute values.
    pub fn to_values(&self) -> Vec<String> {
        self.peers.values().cloned().collect()
    }
}

fn normalize(address: &str) -> String {
    address.trim().to_lowercase()
}

impl PartialEq for PeerSet {
    fn eq(&self, other: &Self) -> bool {
        self.peers.len() == other.peers.len() && self.peers.keys().eq(other.peers.keys())
    }
}

impl Eq for PeerSet {}

impl fmt::Debug for PeerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.peers.values()).finish()
    }
}

impl<S: Into<String>> FromIterator<S> for PeerSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = PeerSet::new();
        for address in iter {
            set.insert(address);
        }
        set
    }
}

impl From<Vec<String>> for PeerSet {
    fn from(values: Vec<String>) -> Self {
        values.into_iter().collect()
    }
}

impl From<PeerSet> for Vec<String> {
    fn from(set: PeerSet) -> Self {
        set.to_values()
    }
}
