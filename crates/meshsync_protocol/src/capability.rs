//! Protocol capabilities and compression negotiation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A protocol feature a peer may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Sliding-window data transfer.
    SlidingWindow,
    /// Query-filtered sync.
    QuerySync,
    /// Subscribe / unsubscribe control commands.
    Subscribe,
    /// Compressed data packets.
    Compression,
    /// Permission flags on data packets.
    PermissionCheck,
    /// Remote query execution.
    RemoteQuery,
}

impl Capability {
    /// Negotiation order, highest priority first.
    pub const PRIORITY: [Capability; 6] = [
        Capability::SlidingWindow,
        Capability::QuerySync,
        Capability::Subscribe,
        Capability::RemoteQuery,
        Capability::PermissionCheck,
        Capability::Compression,
    ];
}

/// The set of capabilities a peer declares.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every capability this build knows about.
    pub fn all() -> Self {
        Capability::PRIORITY.into_iter().collect()
    }

    /// Adds a capability.
    pub fn with(mut self, capability: Capability) -> Self {
        self.0.insert(capability);
        self
    }

    /// Returns true if the set holds `capability`.
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Capabilities both sides support.
    pub fn intersect(&self, other: &CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0.intersection(&other.0).copied().collect())
    }

    /// Shared capabilities in priority order.
    pub fn negotiate(&self, other: &CapabilitySet) -> Vec<Capability> {
        let shared = self.intersect(other);
        Capability::PRIORITY
            .into_iter()
            .filter(|c| shared.contains(*c))
            .collect()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        CapabilitySet(iter.into_iter().collect())
    }
}

/// Packet compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CompressAlgorithm {
    /// No compression.
    None,
    /// zlib deflate.
    Zlib,
}

impl CompressAlgorithm {
    /// Selection order, highest priority first.
    pub const PRIORITY: [CompressAlgorithm; 1] = [CompressAlgorithm::Zlib];

    /// Picks the highest-priority algorithm both sides support.
    pub fn choose(local: &[CompressAlgorithm], remote: &[CompressAlgorithm]) -> CompressAlgorithm {
        Self::PRIORITY
            .into_iter()
            .find(|a| local.contains(a) && remote.contains(a))
            .unwrap_or(CompressAlgorithm::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_follows_priority_not_set_order() {
        let local = CapabilitySet::all();
        let remote = CapabilitySet::new()
            .with(Capability::Compression)
            .with(Capability::SlidingWindow)
            .with(Capability::RemoteQuery);
        assert_eq!(
            local.negotiate(&remote),
            vec![
                Capability::SlidingWindow,
                Capability::RemoteQuery,
                Capability::Compression
            ]
        );
    }

    #[test]
    fn disjoint_sets_negotiate_nothing() {
        let a = CapabilitySet::new().with(Capability::QuerySync);
        let b = CapabilitySet::new().with(Capability::Subscribe);
        assert!(a.intersect(&b).is_empty());
        assert!(a.negotiate(&b).is_empty());
    }

    #[test]
    fn compression_falls_back_to_none() {
        use CompressAlgorithm::*;
        assert_eq!(CompressAlgorithm::choose(&[Zlib], &[Zlib, None]), Zlib);
        assert_eq!(CompressAlgorithm::choose(&[Zlib], &[]), None);
    }
}
