use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::picker::{BlockOutcome, PiecePicker};
use super::table::SessionTable;
use crate::config::SessionConfig;
use crate::constants::{KEEPALIVE_INTERVAL, MAX_REQUEST_LENGTH, UPLOAD_HIGH_WATER};
use crate::error::Error;
use crate::metainfo::{HashingPool, InfoHash, Metainfo};
use crate::peer::{
    Block, BlockRequest, ChokingAlgorithm, Message, PeerChannel, PeerError, PeerId, PeerState,
};
use crate::reactor::{ConnectionId, ConnectionInfo, Direction, ReactorHandle};
use crate::storage::{PieceState, PieceStore, StorageError};
use crate::tracker::TransferStats;

struct TorrentState {
    peers: HashMap<PeerId, PeerState>,
    /// Outbound connects not yet handshaken.
    connecting: HashSet<SocketAddr>,
    picker: PiecePicker,
    choker: ChokingAlgorithm,
}

/// One torrent being seeded and/or downloaded.
///
/// Peer state lives in an arena keyed by peer id; peer channels refer to
/// their entry by key. All mutation happens on the reactor thread, either
/// from channel callbacks or from closures sent through
/// [`ReactorHandle::execute`].
pub struct TorrentSession {
    metainfo: Metainfo,
    store: Arc<PieceStore>,
    config: SessionConfig,
    reactor: ReactorHandle,
    pool: Arc<HashingPool>,
    state: Mutex<TorrentState>,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    stopped: AtomicBool,
    stop_signal: watch::Sender<bool>,
    completed: watch::Sender<bool>,
}

impl fmt::Debug for TorrentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorrentSession")
            .field("name", &self.metainfo.info.name)
            .field("info_hash", &self.metainfo.info_hash)
            .field("verified", &self.store.verified_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl TorrentSession {
    /// Creates a session over a store whose existing data has already been
    /// checked.
    pub fn new(
        metainfo: Metainfo,
        store: Arc<PieceStore>,
        config: SessionConfig,
        reactor: ReactorHandle,
        pool: Arc<HashingPool>,
    ) -> Arc<Self> {
        let picker = PiecePicker::new(
            &store.bitfield(),
            store.piece_length(),
            store.total_length(),
            config.block_size,
            config.endgame_threshold,
        );
        let (completed, _) = watch::channel(store.is_complete());
        let (stop_signal, _) = watch::channel(false);

        Arc::new(Self {
            state: Mutex::new(TorrentState {
                peers: HashMap::new(),
                connecting: HashSet::new(),
                picker,
                choker: ChokingAlgorithm::new(config.max_unchoked),
            }),
            metainfo,
            store,
            config,
            reactor,
            pool,
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            stop_signal,
            completed,
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.metainfo.info_hash
    }

    pub fn name(&self) -> &str {
        &self.metainfo.info.name
    }

    pub fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    pub fn store(&self) -> &Arc<PieceStore> {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_complete(&self) -> bool {
        self.store.is_complete()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Flips to `true` once every piece is verified, after `have` messages
    /// for the last piece are queued.
    pub fn subscribe_completion(&self) -> watch::Receiver<bool> {
        self.completed.subscribe()
    }

    /// Flips to `true` when the session stops.
    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_signal.subscribe()
    }

    pub fn transfer_stats(&self) -> TransferStats {
        TransferStats {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left: self.store.left(),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn connecting_count(&self) -> usize {
        self.state.lock().connecting.len()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.state.lock().peers.keys().copied().collect()
    }

    /// Reserves a connect slot for `addr`. Fails when the session is
    /// stopped, the peer is known, or connected plus connecting peers reach
    /// the limit.
    pub fn begin_connect(&self, addr: SocketAddr) -> bool {
        if self.is_stopped() {
            return false;
        }
        let mut state = self.state.lock();
        if state.connecting.contains(&addr) || state.peers.values().any(|p| p.addr == addr) {
            return false;
        }
        if state.peers.len() + state.connecting.len() >= self.config.max_peers {
            return false;
        }
        state.connecting.insert(addr)
    }

    pub fn end_connect(&self, addr: SocketAddr) {
        self.state.lock().connecting.remove(&addr);
    }

    /// Asks the reactor to connect to each new address. Returns how many
    /// connects were started.
    pub fn connect_peers<I>(self: &Arc<Self>, table: &Arc<SessionTable>, addrs: I) -> usize
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        let mut started = 0;
        for addr in addrs {
            if !self.begin_connect(addr) {
                continue;
            }
            let channel = PeerChannel::outbound(Arc::clone(table), Arc::clone(self), addr);
            match self.reactor.connect(addr, Box::new(channel)) {
                Ok(()) => started += 1,
                Err(e) => {
                    self.end_connect(addr);
                    debug!(%addr, error = %e, "could not queue connect");
                    break;
                }
            }
        }
        if started > 0 {
            debug!(torrent = %self.name(), started, "connecting to peers");
        }
        started
    }

    /// Adds a handshaken peer to the arena and queues our bitfield.
    pub fn attach_peer(&self, info: &ConnectionInfo, peer_id: PeerId) -> Result<(), PeerError> {
        if self.is_stopped() {
            return Err(PeerError::SessionStopped);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if info.direction == Direction::Inbound
            && state.peers.len() + state.connecting.len() >= self.config.max_peers
        {
            return Err(PeerError::TooManyPeers);
        }

        let mut peer = PeerState::new(peer_id, info.id, info.peer_addr, self.store.piece_count());
        if self.store.verified_count() > 0 {
            peer.send(&Message::Bitfield(self.store.bitfield().to_bytes()));
        }
        state.choker.add_peer(peer_id);
        state.peers.insert(peer_id, peer);

        debug!(
            torrent = %self.name(),
            peer = %peer_id,
            addr = %info.peer_addr,
            direction = ?info.direction,
            "peer attached"
        );
        Ok(())
    }

    /// Removes a peer, returning its in-flight blocks to the picker.
    pub fn detach_peer(&self, peer_id: &PeerId, connection: ConnectionId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state
            .peers
            .get(peer_id)
            .is_some_and(|p| p.connection == connection)
        {
            return;
        }

        if let Some(peer) = state.peers.remove(peer_id) {
            state
                .picker
                .peer_gone(peer_id, &peer.bitfield, &peer.in_flight);
            state.choker.remove_peer(peer_id);
            debug!(
                torrent = %self.name(),
                peer = %peer_id,
                downloaded = peer.downloaded,
                uploaded = peer.uploaded,
                "peer detached"
            );
        }

        for peer in state.peers.values_mut() {
            fill_pipeline(peer, &mut state.picker, &self.config);
        }
    }

    /// Applies one message from a peer. An error means the peer must be
    /// dropped; a storage resource error also stops the session.
    pub fn handle_message(self: &Arc<Self>, peer_id: &PeerId, message: Message) -> Result<(), PeerError> {
        if self.is_stopped() {
            return Err(PeerError::SessionStopped);
        }

        let result = {
            let mut guard = self.state.lock();
            self.apply(&mut guard, peer_id, message)
        };

        if let Err(PeerError::Storage(e)) = &result {
            if e.is_resource() {
                self.fail(e);
            }
        }
        result
    }

    fn apply(
        self: &Arc<Self>,
        state: &mut TorrentState,
        peer_id: &PeerId,
        message: Message,
    ) -> Result<(), PeerError> {
        let peer = state
            .peers
            .get_mut(peer_id)
            .ok_or(PeerError::SessionStopped)?;
        let first = !matches!(message, Message::KeepAlive) && peer.mark_received();
        trace!(peer = %peer_id, message = message.name(), "received");

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                peer.choking.peer_choking = true;
                let dropped = std::mem::take(&mut peer.in_flight);
                state.picker.cancel_requests(peer_id, &dropped);
            }
            Message::Unchoke => {
                peer.choking.peer_choking = false;
                fill_pipeline(peer, &mut state.picker, &self.config);
            }
            Message::Interested => {
                peer.choking.peer_interested = true;
                if state.choker.set_interested(peer_id, true) {
                    peer.set_choking(false);
                }
            }
            Message::NotInterested => {
                peer.choking.peer_interested = false;
                state.choker.set_interested(peer_id, false);
                if peer.set_choking(true) {
                    state.choker.set_choked(peer_id, true);
                }
            }
            Message::Have { piece } => {
                if peer.apply_have(piece)? {
                    state.picker.peer_have(piece);
                    refresh_interest(peer, &mut state.picker, &self.config);
                }
            }
            Message::Bitfield(payload) => {
                peer.apply_bitfield(&payload, first)?;
                state.picker.peer_bitfield(&peer.bitfield);
                refresh_interest(peer, &mut state.picker, &self.config);
            }
            Message::Request {
                index,
                begin,
                length,
            } => self.queue_upload(peer, BlockRequest::new(index, begin, length))?,
            Message::Piece { index, begin, data } => {
                return self.on_block(state, peer_id, index, begin, data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                peer.cancel_upload(&BlockRequest::new(index, begin, length));
            }
            Message::Unknown(id) => trace!(peer = %peer_id, id, "skipping unknown message"),
        }
        Ok(())
    }

    fn queue_upload(&self, peer: &mut PeerState, request: BlockRequest) -> Result<(), PeerError> {
        if request.length == 0 || request.length > MAX_REQUEST_LENGTH {
            debug!(peer = %peer.id, length = request.length, "refusing request length");
            return Ok(());
        }
        if peer.choking.am_choking {
            trace!(peer = %peer.id, "ignoring request from choked peer");
            return Ok(());
        }
        if !self.store.has_piece(request.piece) {
            debug!(peer = %peer.id, piece = request.piece, "ignoring request for a piece we lack");
            return Ok(());
        }
        if request.offset as u64 + request.length as u64 > self.store.piece_size(request.piece) {
            return Err(PeerError::Protocol(format!(
                "request {}:{}+{} beyond piece end",
                request.piece, request.offset, request.length
            )));
        }
        peer.queue_upload(request);
        Ok(())
    }

    fn on_block(
        self: &Arc<Self>,
        state: &mut TorrentState,
        peer_id: &PeerId,
        index: u32,
        begin: u32,
        data: Bytes,
    ) -> Result<(), PeerError> {
        let request = BlockRequest::new(index, begin, data.len() as u32);
        let length = data.len() as u64;
        if let Some(peer) = state.peers.get_mut(peer_id) {
            peer.complete_request(&request);
            peer.downloaded += length;
        }
        self.downloaded.fetch_add(length, Ordering::Relaxed);
        state.choker.record_download(peer_id, length);

        match state.picker.block_received(peer_id, &request) {
            BlockOutcome::Invalid => {
                return Err(PeerError::Protocol(format!(
                    "unexpected block {index}:{begin}+{length}"
                )));
            }
            BlockOutcome::Duplicate => trace!(peer = %peer_id, index, begin, "duplicate block"),
            BlockOutcome::Accepted { cancel } => {
                for other in cancel {
                    if let Some(peer) = state.peers.get_mut(&other) {
                        if peer.complete_request(&request) {
                            peer.send(&request.to_cancel());
                        }
                    }
                }
                if self.store.write_block(index, begin, &data)? == PieceState::Complete {
                    self.schedule_verification(index)?;
                }
            }
        }

        if let Some(peer) = state.peers.get_mut(peer_id) {
            fill_pipeline(peer, &mut state.picker, &self.config);
        }
        Ok(())
    }

    /// Checks a completed piece on the hashing pool and hands the result
    /// back to the reactor thread.
    fn schedule_verification(self: &Arc<Self>, piece: u32) -> Result<(), PeerError> {
        let session = Arc::clone(self);
        self.pool
            .execute(move || {
                let result = session.store.verify_piece(piece);
                let reactor = session.reactor.clone();
                if reactor
                    .execute(move || session.on_piece_checked(piece, result))
                    .is_err()
                {
                    trace!(piece, "reactor stopped before verification finished");
                }
            })
            .map_err(|e| PeerError::Storage(StorageError::Hashing(e)))
    }

    pub(crate) fn on_piece_checked(self: &Arc<Self>, piece: u32, result: Result<bool, StorageError>) {
        if self.is_stopped() {
            trace!(piece, "ignoring verification after stop");
            return;
        }

        match result {
            Ok(true) => {
                {
                    let mut guard = self.state.lock();
                    let state = &mut *guard;
                    state.picker.piece_verified(piece);
                    let have = Message::Have { piece };
                    for peer in state.peers.values_mut() {
                        peer.send(&have);
                        refresh_interest(peer, &mut state.picker, &self.config);
                    }
                }
                debug!(torrent = %self.name(), piece, "piece verified");

                if self.store.is_complete() && !*self.completed.borrow() {
                    info!(torrent = %self.name(), "download complete");
                    self.completed.send_replace(true);
                }
            }
            Ok(false) => {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let contributors = state.picker.piece_failed(piece);
                let error = Error::from(StorageError::HashMismatch(piece));
                warn!(
                    torrent = %self.name(),
                    %error,
                    kind = ?error.kind(),
                    peers = contributors.len(),
                    "dropping peers that sent a corrupt piece"
                );
                for id in &contributors {
                    if let Some(peer) = state.peers.get(id) {
                        let _ = self.reactor.close(peer.connection);
                    }
                }
                for peer in state.peers.values_mut() {
                    if !contributors.contains(&peer.id) {
                        fill_pipeline(peer, &mut state.picker, &self.config);
                    }
                }
            }
            Err(e) => self.fail(&e),
        }
    }

    /// Moves queued messages for `peer_id` into `out`, then serves queued
    /// uploads until `out` holds enough to keep the socket busy.
    pub fn drain_outbound(&self, peer_id: &PeerId, out: &mut BytesMut) {
        let mut failure = None;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(peer) = state.peers.get_mut(peer_id) else {
                return;
            };
            peer.drain_outbox(out);

            while out.len() < UPLOAD_HIGH_WATER && !peer.choking.am_choking {
                let Some(request) = peer.upload_queue.pop_front() else {
                    break;
                };
                match self
                    .store
                    .read_block(request.piece, request.offset, request.length)
                {
                    Ok(data) => {
                        let length = data.len() as u64;
                        Block::new(request.piece, request.offset, data)
                            .into_message()
                            .encode_into(out);
                        peer.uploaded += length;
                        self.uploaded.fetch_add(length, Ordering::Relaxed);
                        state.choker.record_upload(peer_id, length);
                    }
                    Err(e) if e.is_resource() => {
                        failure = Some(e);
                        break;
                    }
                    Err(e) => debug!(peer = %peer_id, error = %e, "dropping upload request"),
                }
            }
        }

        if let Some(e) = failure {
            self.fail(&e);
        }
    }

    /// One round of the choking policy, plus keep-alives for quiet peers.
    pub fn rechoke(&self) {
        if self.is_stopped() {
            return;
        }
        let seeding = self.store.is_complete();
        let now = Instant::now();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        for (id, unchoke) in state.choker.rechoke(seeding) {
            if let Some(peer) = state.peers.get_mut(&id) {
                peer.set_choking(!unchoke);
            }
        }
        for peer in state.peers.values_mut() {
            if peer.keepalive_due(now, KEEPALIVE_INTERVAL) {
                peer.send(&Message::KeepAlive);
            }
        }
    }

    /// Stops the session and closes every peer connection. Late
    /// verification results are ignored.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_signal.send_replace(true);
        let mut state = self.state.lock();
        for peer in state.peers.values() {
            let _ = self.reactor.close(peer.connection);
        }
        state.connecting.clear();
        info!(torrent = %self.name(), peers = state.peers.len(), "session stopped");
    }

    fn fail(&self, error: &StorageError) {
        error!(torrent = %self.name(), %error, "storage failure, stopping session");
        self.stop();
    }
}

fn refresh_interest(peer: &mut PeerState, picker: &mut PiecePicker, config: &SessionConfig) {
    let wanted = picker.interesting(&peer.bitfield);
    peer.set_interest(wanted);
    fill_pipeline(peer, picker, config);
}

fn fill_pipeline(peer: &mut PeerState, picker: &mut PiecePicker, config: &SessionConfig) {
    if !peer.can_request() {
        return;
    }
    let room = peer.pipeline_room(config.pipeline_depth);
    for request in picker.next_requests(&peer.id, &peer.bitfield, room) {
        peer.send(&request.to_request());
        peer.in_flight.push(request);
    }
}
