//! Membership registry: this node's address and the peers it knows about

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

/// How an incoming ADD_HOST snapshot is applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipPolicy {
    /// The snapshot replaces the local peer set (last writer wins)
    #[default]
    Replace,
    /// The snapshot is unioned into the local peer set
    Union,
}

/// Known peers in insertion order, never containing the local address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipRegistry {
    local_address: String,
    peers: IndexSet<String>,
    /// Consecutive failed deliveries per peer
    failures: IndexMap<String, u32>,
}

impl MembershipRegistry {
    /// Create a registry with no peers
    pub fn new(local_address: impl Into<String>) -> Self {
        Self {
            local_address: local_address.into(),
            peers: IndexSet::new(),
            failures: IndexMap::new(),
        }
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Change the advertised address, e.g. once an ephemeral port is bound
    pub fn set_local_address(&mut self, address: impl Into<String>) {
        self.local_address = address.into();
        let local = self.local_address.clone();
        self.remove(&local);
    }

    /// Add one peer. Returns false for self, blanks, and already-known peers.
    pub fn add(&mut self, address: &str) -> bool {
        let address = address.trim();
        if address.is_empty() || address == self.local_address {
            return false;
        }
        self.peers.insert(address.to_string())
    }

    /// Forget a peer. Returns true if it was known.
    pub fn remove(&mut self, address: &str) -> bool {
        self.failures.shift_remove(address);
        self.peers.shift_remove(address)
    }

    /// Union `addresses` into the peer set
    pub fn merge<I, S>(&mut self, addresses: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        addresses
            .into_iter()
            .filter(|address| self.add(address.as_ref()))
            .count()
    }

    /// Replace the peer set with `addresses`, dropping self and duplicates
    pub fn replace<I, S>(&mut self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.peers.clear();
        self.merge(addresses);
        let peers = &self.peers;
        self.failures.retain(|address, _| peers.contains(address));
    }

    /// Apply a membership snapshot according to `policy`
    pub fn apply_snapshot<I, S>(&mut self, addresses: I, policy: MembershipPolicy)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        match policy {
            MembershipPolicy::Replace => self.replace(addresses),
            MembershipPolicy::Union => {
                self.merge(addresses);
            },
        }
    }

    /// Current peers plus self; the snapshot sent back to a joiner
    pub fn snapshot_with_self(&self) -> Vec<String> {
        self.peers
            .iter()
            .cloned()
            .chain(std::iter::once(self.local_address.clone()))
            .collect()
    }

    /// Snapshot for `recipient` announcing `joiner`: known peers, the joiner
    /// and self, deduplicated, without the recipient itself
    pub fn snapshot_for(&self, recipient: &str, joiner: &str) -> Vec<String> {
        let mut list: IndexSet<&str> = self.peers.iter().map(String::as_str).collect();
        list.insert(joiner);
        list.insert(&self.local_address);
        list.shift_remove(recipient);
        list.into_iter().map(str::to_string).collect()
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.iter().cloned().collect()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.contains(address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Count a failed delivery; returns the consecutive failure count
    pub fn record_failure(&mut self, address: &str) -> u32 {
        if !self.peers.contains(address) {
            return 0;
        }
        let count = self.failures.entry(address.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_success(&mut self, address: &str) {
        self.failures.shift_remove(address);
    }

    /// Drop every peer whose consecutive failures reached `threshold`
    pub fn evict_failing(&mut self, threshold: u32) -> Vec<String> {
        let evicted: Vec<String> = self
            .failures
            .iter()
            .filter(|(_, count)| **count >= threshold)
            .map(|(address, _)| address.clone())
            .collect();
        for address in &evicted {
            self.remove(address);
        }
        evicted
    }
}
