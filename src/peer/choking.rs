use rand::Rng as _;
use std::collections::HashMap;

use super::peer_id::PeerId;
use crate::constants::OPTIMISTIC_UNCHOKE_ROUNDS;

/// Per-peer counters for the current rechoke round.
#[derive(Debug, Clone, Default)]
pub struct PeerStats {
    /// Bytes received from the peer this round.
    pub downloaded: u64,
    /// Bytes sent to the peer this round.
    pub uploaded: u64,
    pub interested: bool,
    pub we_choking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokingState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokingState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Upload slot policy.
///
/// Each round keeps the interested peers that gave us the most data (or, as a
/// seed, took the most) unchoked, plus one optimistic slot that rotates every
/// few rounds. Between rounds a newly interested peer is unchoked at once if
/// a slot is free.
#[derive(Debug)]
pub struct ChokingAlgorithm {
    peers: HashMap<PeerId, PeerStats>,
    max_unchoked: usize,
    optimistic_peer: Option<PeerId>,
    rounds_since_optimistic: u32,
}

impl ChokingAlgorithm {
    pub fn new(max_unchoked: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_unchoked: max_unchoked.max(1),
            optimistic_peer: None,
            rounds_since_optimistic: OPTIMISTIC_UNCHOKE_ROUNDS,
        }
    }

    pub fn add_peer(&mut self, id: PeerId) {
        self.peers.insert(
            id,
            PeerStats {
                we_choking: true,
                ..PeerStats::default()
            },
        );
    }

    pub fn remove_peer(&mut self, id: &PeerId) {
        self.peers.remove(id);
        if self.optimistic_peer.as_ref() == Some(id) {
            self.optimistic_peer = None;
        }
    }

    pub fn record_download(&mut self, id: &PeerId, bytes: u64) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.downloaded += bytes;
        }
    }

    pub fn record_upload(&mut self, id: &PeerId, bytes: u64) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.uploaded += bytes;
        }
    }

    /// Records interest. Returns `true` when the peer should be unchoked
    /// now because a slot is free.
    pub fn set_interested(&mut self, id: &PeerId, interested: bool) -> bool {
        let unchoked = self.unchoked_count();
        let Some(peer) = self.peers.get_mut(id) else {
            return false;
        };
        peer.interested = interested;
        if interested && peer.we_choking && unchoked < self.max_unchoked {
            peer.we_choking = false;
            return true;
        }
        false
    }

    /// Records a choke state applied outside a rechoke round.
    pub fn set_choked(&mut self, id: &PeerId, choked: bool) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.we_choking = choked;
        }
    }

    /// Runs one rechoke round and returns the peers whose state changes,
    /// with `true` meaning unchoke.
    pub fn rechoke(&mut self, is_seed: bool) -> Vec<(PeerId, bool)> {
        let mut candidates: Vec<(&PeerId, &PeerStats)> = self
            .peers
            .iter()
            .filter(|(_, stats)| stats.interested)
            .collect();

        if is_seed {
            candidates.sort_by(|(_, a), (_, b)| b.uploaded.cmp(&a.uploaded));
        } else {
            candidates.sort_by(|(_, a), (_, b)| b.downloaded.cmp(&a.downloaded));
        }

        let regular = self.max_unchoked.saturating_sub(1).max(1);
        let mut to_unchoke: Vec<PeerId> = candidates
            .iter()
            .take(regular)
            .map(|(id, _)| **id)
            .collect();

        self.rounds_since_optimistic += 1;
        let optimistic_lost = self
            .optimistic_peer
            .is_none_or(|id| !self.peers.get(&id).is_some_and(|s| s.interested));
        if self.rounds_since_optimistic >= OPTIMISTIC_UNCHOKE_ROUNDS || optimistic_lost {
            let choked_interested: Vec<PeerId> = self
                .peers
                .iter()
                .filter(|(id, stats)| stats.interested && !to_unchoke.contains(id))
                .map(|(id, _)| *id)
                .collect();

            self.optimistic_peer = if choked_interested.is_empty() {
                None
            } else {
                let idx = rand::rng().random_range(0..choked_interested.len());
                Some(choked_interested[idx])
            };
            self.rounds_since_optimistic = 0;
        }

        if let Some(opt) = self.optimistic_peer {
            if !to_unchoke.contains(&opt) && to_unchoke.len() < self.max_unchoked {
                to_unchoke.push(opt);
            }
        }

        let mut decisions = Vec::new();
        for (id, stats) in self.peers.iter_mut() {
            let unchoke = to_unchoke.contains(id);
            if unchoke == stats.we_choking {
                decisions.push((*id, unchoke));
                stats.we_choking = !unchoke;
            }
            stats.downloaded = 0;
            stats.uploaded = 0;
        }

        decisions
    }

    pub fn unchoked_count(&self) -> usize {
        self.peers.values().filter(|s| !s.we_choking).count()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
