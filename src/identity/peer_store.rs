//! Table of every peer observed by any transport.

use crate::identity::{Address, PeerId, TransportKind};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Everything known about one peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Identity
    pub peer: PeerId,
    /// Known addresses, most recently observed last
    pub addresses: Vec<Address>,
    /// Signal strength or link quality of the latest observation
    pub quality: Option<i16>,
    /// Time of the latest observation
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    /// Addresses reachable over the given transport
    pub fn addresses_for(&self, kind: TransportKind) -> impl Iterator<Item = &Address> {
        self.addresses.iter().filter(move |a| a.kind() == kind)
    }
}

/// Peer table keyed by [`PeerId`]. Entries only leave by explicit eviction.
#[derive(Debug, Default)]
pub struct PeerStore {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl PeerStore {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an observation into the table and refresh `last_seen`.
    ///
    /// Addresses are unioned; a re-observed address moves to the back so the
    /// freshest address of each kind is tried first.
    pub fn upsert(&self, observed: PeerRecord) -> PeerRecord {
        let mut peers = self.peers.write();
        let record = peers
            .entry(observed.peer.clone())
            .or_insert_with(|| PeerRecord {
                peer: observed.peer.clone(),
                addresses: Vec::new(),
                quality: None,
                last_seen: observed.last_seen,
            });

        if !observed.peer.display_name().is_empty() {
            record.peer = observed.peer.clone();
        }
        for address in observed.addresses {
            record.addresses.retain(|known| known != &address);
            record.addresses.push(address);
        }
        if observed.quality.is_some() {
            record.quality = observed.quality;
        }
        record.last_seen = Utc::now().max(observed.last_seen);
        record.clone()
    }

    /// Record a single address for a peer
    pub fn observe(&self, peer: &PeerId, address: Address, quality: Option<i16>) -> PeerRecord {
        self.upsert(PeerRecord {
            peer: peer.clone(),
            addresses: vec![address],
            quality,
            last_seen: Utc::now(),
        })
    }

    /// Look up a peer
    pub fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.read().get(id).cloned()
    }

    /// Snapshot of every peer
    pub fn all(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    /// Find the peer an address belongs to
    pub fn peer_for_address(&self, address: &Address) -> Option<PeerId> {
        self.peers
            .read()
            .values()
            .find(|record| record.addresses.contains(address))
            .map(|record| record.peer.clone())
    }

    /// Drop an address that turned out to be stale
    pub fn forget_address(&self, id: &PeerId, address: &Address) {
        if let Some(record) = self.peers.write().get_mut(id) {
            record.addresses.retain(|known| known != address);
        }
    }

    /// Explicitly evict a peer
    pub fn evict(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.write().remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{address::parse_address, ChainType};

    fn bob() -> PeerId {
        PeerId::new("0xB0B", ChainType::Ethereum, "Bob")
    }

    #[test]
    fn test_upsert_merges_addresses() {
        let store = PeerStore::new();
        store.observe(&bob(), parse_address("relay/s/bob").unwrap(), None);
        let record = store.observe(&bob(), parse_address("radio/dev-1").unwrap(), Some(-60));

        assert_eq!(record.addresses.len(), 2);
        assert_eq!(record.quality, Some(-60));
        assert_eq!(store.all().len(), 1);
        assert_eq!(
            store.peer_for_address(&parse_address("radio/dev-1").unwrap()),
            Some(bob())
        );
    }

    #[test]
    fn test_last_seen_advances() {
        let store = PeerStore::new();
        let first = store.observe(&bob(), parse_address("relay/s/bob").unwrap(), None);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.observe(&bob(), parse_address("relay/s/bob").unwrap(), None);

        assert!(second.last_seen > first.last_seen);
        assert_eq!(second.addresses.len(), 1);
    }

    #[test]
    fn test_only_explicit_eviction_removes() {
        let store = PeerStore::new();
        store.observe(&bob(), parse_address("tcp/127.0.0.1/4001").unwrap(), None);
        store.forget_address(&bob(), &parse_address("tcp/127.0.0.1/4001").unwrap());

        let record = store.get(&bob()).unwrap();
        assert!(record.addresses.is_empty());

        assert!(store.evict(&bob()).is_some());
        assert!(store.get(&bob()).is_none());
    }
}
