use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::metainfo::InfoHash;
use crate::peer::PeerId;
use crate::tracker::{ScrapeFile, ScrapeResponse, TrackerEvent};

/// One peer as the tracker last heard of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmPeer {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub last_seen: Instant,
    pub completed: bool,
}

impl SwarmPeer {
    pub fn is_seed(&self) -> bool {
        self.left == 0
    }

    fn expired(&self, now: Instant, expiry: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > expiry
    }
}

/// A decoded announce.
#[derive(Debug, Clone)]
pub struct Announce {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
}

/// What an announcing peer is told about its swarm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwarmView {
    pub complete: u32,
    pub incomplete: u32,
    /// Other live peers, a random sample.
    pub peers: Vec<SwarmPeer>,
}

#[derive(Debug, Default)]
struct Swarm {
    peers: HashMap<PeerId, SwarmPeer>,
    /// `completed` events seen over the swarm's lifetime.
    downloaded: u32,
}

impl Swarm {
    fn counts(&self, now: Instant, expiry: Duration) -> (u32, u32) {
        self.peers
            .values()
            .filter(|p| !p.expired(now, expiry))
            .fold((0, 0), |(seeds, leeches), p| {
                if p.is_seed() {
                    (seeds + 1, leeches)
                } else {
                    (seeds, leeches + 1)
                }
            })
    }
}

/// Swarm membership for every torrent the tracker has heard of.
#[derive(Debug)]
pub struct SwarmRegistry {
    swarms: DashMap<InfoHash, Swarm>,
    expiry: Duration,
}

impl SwarmRegistry {
    /// Peers silent for longer than `expiry` are never handed out and are
    /// removed by [`sweep`](Self::sweep).
    pub fn new(expiry: Duration) -> Self {
        Self {
            swarms: DashMap::new(),
            expiry,
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Records an announce and returns up to `max_peers` other live peers.
    ///
    /// `stopped` removes the peer; `completed` is counted once per peer.
    pub fn announce(&self, announce: &Announce, max_peers: usize, now: Instant) -> SwarmView {
        let mut swarm = self.swarms.entry(announce.info_hash).or_default();

        if announce.event == TrackerEvent::Stopped {
            if swarm.peers.remove(&announce.peer_id).is_some() {
                debug!(info_hash = %announce.info_hash, peer = %announce.peer_id, "peer left swarm");
            }
        } else {
            let previous = swarm.peers.get(&announce.peer_id).map(|p| p.completed);
            let completed = previous.unwrap_or(false)
                || announce.event == TrackerEvent::Completed;
            if announce.event == TrackerEvent::Completed && previous != Some(true) {
                swarm.downloaded = swarm.downloaded.saturating_add(1);
            }
            if previous.is_none() {
                debug!(
                    info_hash = %announce.info_hash,
                    peer = %announce.peer_id,
                    addr = %announce.addr,
                    "peer joined swarm"
                );
            }
            swarm.peers.insert(
                announce.peer_id,
                SwarmPeer {
                    peer_id: announce.peer_id,
                    addr: announce.addr,
                    uploaded: announce.uploaded,
                    downloaded: announce.downloaded,
                    left: announce.left,
                    last_seen: now,
                    completed,
                },
            );
        }

        let (complete, incomplete) = swarm.counts(now, self.expiry);
        let mut peers: Vec<SwarmPeer> = swarm
            .peers
            .values()
            .filter(|p| p.peer_id != announce.peer_id && !p.expired(now, self.expiry))
            .cloned()
            .collect();
        drop(swarm);

        if peers.len() > max_peers {
            peers.shuffle(&mut rand::rng());
            peers.truncate(max_peers);
        }

        SwarmView {
            complete,
            incomplete,
            peers,
        }
    }

    /// Statistics for each requested torrent; unknown torrents report zeros.
    /// An empty request scrapes every torrent.
    pub fn scrape(&self, info_hashes: &[InfoHash], now: Instant) -> ScrapeResponse {
        let file = |info_hash: InfoHash, swarm: Option<&Swarm>| {
            let (complete, incomplete) = swarm.map_or((0, 0), |s| s.counts(now, self.expiry));
            ScrapeFile {
                info_hash,
                complete,
                incomplete,
                downloaded: swarm.map_or(0, |s| s.downloaded),
            }
        };

        let files = if info_hashes.is_empty() {
            self.swarms
                .iter()
                .map(|entry| file(*entry.key(), Some(entry.value())))
                .collect()
        } else {
            info_hashes
                .iter()
                .map(|ih| file(*ih, self.swarms.get(ih).as_deref()))
                .collect()
        };
        ScrapeResponse { files }
    }

    /// Evicts expired peers and, if `remove_empty`, torrents left without
    /// peers. Returns the number of evicted peers.
    pub fn sweep(&self, now: Instant, remove_empty: bool) -> usize {
        let mut evicted = 0;
        for mut swarm in self.swarms.iter_mut() {
            let before = swarm.peers.len();
            swarm.peers.retain(|_, p| !p.expired(now, self.expiry));
            evicted += before - swarm.peers.len();
        }
        if remove_empty {
            self.swarms.retain(|info_hash, swarm| {
                let keep = !swarm.peers.is_empty();
                if !keep {
                    trace!(%info_hash, "dropping empty swarm");
                }
                keep
            });
        }
        if evicted > 0 {
            debug!(evicted, torrents = self.swarms.len(), "swept expired peers");
        }
        evicted
    }

    pub fn torrent_count(&self) -> usize {
        self.swarms.len()
    }

    pub fn peer_count(&self, info_hash: &InfoHash) -> usize {
        self.swarms.get(info_hash).map_or(0, |s| s.peers.len())
    }

    pub fn peers(&self, info_hash: &InfoHash) -> Vec<SwarmPeer> {
        self.swarms
            .get(info_hash)
            .map(|s| s.peers.values().cloned().collect())
            .unwrap_or_default()
    }
}
