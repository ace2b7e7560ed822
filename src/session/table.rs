use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::registry::PeerRegistry;
use super::torrent::TorrentSession;
use crate::metainfo::InfoHash;
use crate::peer::PeerId;

/// The torrents a client serves, shared with every peer channel.
#[derive(Debug)]
pub struct SessionTable {
    peer_id: PeerId,
    sessions: DashMap<InfoHash, Arc<TorrentSession>>,
    registry: PeerRegistry,
}

impl SessionTable {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            sessions: DashMap::new(),
            registry: PeerRegistry::new(),
        }
    }

    /// Our own peer id.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Adds a session. Returns `false` if its torrent is already present.
    pub fn insert(&self, session: Arc<TorrentSession>) -> bool {
        match self.sessions.entry(session.info_hash()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(session);
                true
            }
        }
    }

    pub fn get(&self, info_hash: &InfoHash) -> Option<Arc<TorrentSession>> {
        self.sessions.get(info_hash).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, info_hash: &InfoHash) -> Option<Arc<TorrentSession>> {
        self.sessions.remove(info_hash).map(|(_, s)| s)
    }

    pub fn sessions(&self) -> Vec<Arc<TorrentSession>> {
        self.sessions.iter().map(|s| Arc::clone(s.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
