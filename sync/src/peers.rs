//! Connected-peer table.
//!
//! Tracks every peer the transport reports as connected, together with its
//! advertised shard capability, in-flight request count, smoothed
//! round-trip time and failure tally. The advertisement is a first-class
//! field populated from the connect event; the peer-store the transport may
//! keep underneath is not visible here.

use crate::host::PeerId;
use common::{Address, ShardId, ShardMap, LATENCY_EMA_ALPHA};
use std::collections::HashMap;
use std::time::Duration;

/// Book-keeping for one connected peer.
#[derive(Clone, Debug)]
pub struct PeerState {
    pub id: PeerId,
    /// Shards the peer advertised at connect time, per contract.
    pub shards: ShardMap,
    /// Outstanding requests currently addressed to this peer.
    pub in_flight: usize,
    /// Smoothed round-trip time of completed requests.
    pub rtt: Option<Duration>,
    /// Transport and validation faults; the peer is dropped past the cap.
    pub failures: u32,
}

impl PeerState {
    fn new(id: PeerId, shards: ShardMap) -> Self {
        PeerState {
            id,
            shards,
            in_flight: 0,
            rtt: None,
            failures: 0,
        }
    }

    pub fn advertises(&self, contract: Address, shard_id: ShardId) -> bool {
        self.shards
            .get(&contract)
            .is_some_and(|set| set.contains(&shard_id))
    }

    /// Fold a new sample into the RTT estimate.
    pub fn record_rtt(&mut self, sample: Duration) {
        self.rtt = Some(match self.rtt {
            None => sample,
            Some(prev) => prev.mul_f64(1.0 - LATENCY_EMA_ALPHA) + sample.mul_f64(LATENCY_EMA_ALPHA),
        });
    }
}

/// The set of connected peers, bounded by `max_peers`.
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<PeerId, PeerState>,
    max_peers: usize,
    /// Rotates the tiebreak between equally loaded candidates.
    rr_cursor: usize,
}

impl PeerTable {
    pub fn new(max_peers: usize) -> Self {
        PeerTable {
            peers: HashMap::new(),
            max_peers,
            rr_cursor: 0,
        }
    }

    /// Register a peer. Returns `false` (and leaves the table unchanged)
    /// when the table is full or the peer advertises nothing; the caller
    /// closes the connection in that case.
    pub fn add_peer(&mut self, id: PeerId, shards: ShardMap) -> bool {
        if self.peers.contains_key(&id) {
            return true;
        }
        if self.peers.len() >= self.max_peers {
            return false;
        }
        if shards.values().all(|set| set.is_empty()) {
            return false;
        }
        self.peers.insert(id, PeerState::new(id, shards));
        true
    }

    /// Drop a peer. Returns its state so the caller can reroute any work
    /// that was in flight against it.
    pub fn remove_peer(&mut self, id: &PeerId) -> Option<PeerState> {
        self.peers.remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerState> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut PeerState> {
        self.peers.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Whether any connected peer advertises the shard at all (regardless
    /// of load).
    pub fn any_advertises(&self, contract: Address, shard_id: ShardId) -> bool {
        self.peers.values().any(|p| p.advertises(contract, shard_id))
    }

    /// Pick the least-loaded peer advertising `(contract, shard_id)` with
    /// in-flight capacity to spare; ties rotate round-robin so load spreads
    /// across equally idle peers.
    pub fn pick_peer(
        &mut self,
        contract: Address,
        shard_id: ShardId,
        max_in_flight: usize,
    ) -> Option<PeerId> {
        let mut candidates: Vec<(usize, PeerId)> = self
            .peers
            .values()
            .filter(|p| p.advertises(contract, shard_id) && p.in_flight < max_in_flight)
            .map(|p| (p.in_flight, p.id))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        // Deterministic order before the rotation; HashMap order is not.
        candidates.sort();
        let min_load = candidates[0].0;
        let least: Vec<PeerId> = candidates
            .into_iter()
            .take_while(|(load, _)| *load == min_load)
            .map(|(_, id)| id)
            .collect();
        let picked = least[self.rr_cursor % least.len()];
        self.rr_cursor = self.rr_cursor.wrapping_add(1);
        Some(picked)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerState> {
        self.peers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::to_shard_map;
    use common::ContractShards;

    fn contract() -> Address {
        "0x0000000000000000000000000000000003330001".parse().unwrap()
    }

    fn advert(shards: &[u64]) -> ShardMap {
        to_shard_map(&[ContractShards {
            contract: contract(),
            shard_ids: shards.to_vec(),
        }])
    }

    fn peer(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    #[test]
    fn test_add_peer_enforces_limit() {
        let mut table = PeerTable::new(2);
        assert!(table.add_peer(peer(1), advert(&[0])));
        assert!(table.add_peer(peer(2), advert(&[0])));
        assert!(!table.add_peer(peer(3), advert(&[0])), "table full");
        assert!(table.add_peer(peer(1), advert(&[0])), "re-add is a no-op");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_add_peer_rejects_empty_advertisement() {
        let mut table = PeerTable::new(4);
        assert!(!table.add_peer(peer(1), ShardMap::new()));
        assert!(!table.add_peer(peer(2), advert(&[])));
        assert!(table.is_empty());
    }

    #[test]
    fn test_pick_peer_prefers_least_loaded() {
        let mut table = PeerTable::new(4);
        table.add_peer(peer(1), advert(&[0]));
        table.add_peer(peer(2), advert(&[0]));
        table.get_mut(&peer(1)).unwrap().in_flight = 1;

        assert_eq!(table.pick_peer(contract(), 0, 2), Some(peer(2)));
    }

    #[test]
    fn test_pick_peer_round_robin_tiebreak() {
        let mut table = PeerTable::new(4);
        table.add_peer(peer(1), advert(&[0]));
        table.add_peer(peer(2), advert(&[0]));

        let first = table.pick_peer(contract(), 0, 2).unwrap();
        let second = table.pick_peer(contract(), 0, 2).unwrap();
        assert_ne!(first, second, "equal load alternates peers");
    }

    #[test]
    fn test_pick_peer_respects_capacity_and_shard() {
        let mut table = PeerTable::new(4);
        table.add_peer(peer(1), advert(&[0]));
        table.add_peer(peer(2), advert(&[1]));
        table.get_mut(&peer(1)).unwrap().in_flight = 2;

        assert_eq!(table.pick_peer(contract(), 0, 2), None, "saturated");
        assert_eq!(table.pick_peer(contract(), 1, 2), Some(peer(2)));
        assert_eq!(table.pick_peer(contract(), 7, 2), None, "nobody serves it");
        assert!(table.any_advertises(contract(), 0));
        assert!(!table.any_advertises(contract(), 7));
    }

    #[test]
    fn test_rtt_ema_smoothing() {
        let mut state = PeerState::new(peer(1), advert(&[0]));
        state.record_rtt(Duration::from_millis(100));
        assert_eq!(state.rtt, Some(Duration::from_millis(100)));

        state.record_rtt(Duration::from_millis(200));
        let rtt = state.rtt.unwrap();
        assert!(rtt > Duration::from_millis(100) && rtt < Duration::from_millis(200));
    }
}
