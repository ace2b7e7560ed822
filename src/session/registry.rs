use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::torrent::TorrentSession;
use crate::metainfo::InfoHash;
use crate::peer::{PeerError, PeerId};
use crate::reactor::ConnectionId;

#[derive(Debug)]
struct ActivePeer {
    connection: ConnectionId,
    session: Weak<TorrentSession>,
}

/// Every active peer connection across all torrents, keyed by
/// (info-hash, peer id). At most one connection per key.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<(InfoHash, PeerId), ActivePeer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the key for `connection`. Fails if another live connection
    /// holds it.
    pub fn register(
        &self,
        info_hash: InfoHash,
        peer_id: PeerId,
        connection: ConnectionId,
        session: &Arc<TorrentSession>,
    ) -> Result<(), PeerError> {
        let active = ActivePeer {
            connection,
            session: Arc::downgrade(session),
        };
        match self.peers.entry((info_hash, peer_id)) {
            Entry::Occupied(mut entry) => {
                if entry.get().session.strong_count() > 0 {
                    return Err(PeerError::DuplicatePeer(peer_id));
                }
                trace!(%peer_id, "replacing registration of a dropped session");
                entry.insert(active);
            }
            Entry::Vacant(entry) => {
                entry.insert(active);
            }
        }
        Ok(())
    }

    /// Releases the key if `connection` still holds it.
    pub fn unregister(&self, info_hash: InfoHash, peer_id: PeerId, connection: ConnectionId) {
        self.peers
            .remove_if(&(info_hash, peer_id), |_, active| active.connection == connection);
    }

    pub fn session(&self, info_hash: InfoHash, peer_id: PeerId) -> Option<Arc<TorrentSession>> {
        self.peers
            .get(&(info_hash, peer_id))
            .and_then(|active| active.session.upgrade())
    }

    pub fn connection(&self, info_hash: InfoHash, peer_id: PeerId) -> Option<ConnectionId> {
        self.peers.get(&(info_hash, peer_id)).map(|active| active.connection)
    }

    pub fn is_connected(&self, info_hash: InfoHash, peer_id: PeerId) -> bool {
        self.peers.contains_key(&(info_hash, peer_id))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
