use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, trace};

use super::error::PeerError;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use crate::reactor::{ConnectionInfo, ConnectionListener, Direction, ListenerError, ReactorError};
use crate::session::{SessionTable, TorrentSession};

enum Phase {
    Handshaking,
    Active {
        session: Arc<TorrentSession>,
        peer_id: PeerId,
    },
    Closed,
}

/// Reactor listener for one peer socket.
///
/// Frames inbound bytes into messages for the torrent session and pulls the
/// peer's queued messages from the session when the reactor wants output.
/// The channel refers to its peer only by key; the session owns the state.
pub struct PeerChannel {
    table: Arc<SessionTable>,
    /// The torrent an outbound connection was opened for.
    expected: Option<Arc<TorrentSession>>,
    /// Connect slot held in `expected` until the handshake settles.
    pending_connect: Option<SocketAddr>,
    info: Option<ConnectionInfo>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    phase: Phase,
}

impl PeerChannel {
    /// A channel for an accepted connection; the torrent is chosen by the
    /// peer's handshake.
    pub fn inbound(table: Arc<SessionTable>) -> Self {
        Self::new(table, None, None)
    }

    /// A channel for a connection we open to `addr` on behalf of `session`.
    pub fn outbound(table: Arc<SessionTable>, session: Arc<TorrentSession>, addr: SocketAddr) -> Self {
        Self::new(table, Some(session), Some(addr))
    }

    fn new(
        table: Arc<SessionTable>,
        expected: Option<Arc<TorrentSession>>,
        pending_connect: Option<SocketAddr>,
    ) -> Self {
        Self {
            table,
            expected,
            pending_connect,
            info: None,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            phase: Phase::Handshaking,
        }
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        match &self.phase {
            Phase::Active { peer_id, .. } => Some(*peer_id),
            _ => None,
        }
    }

    fn release_connect(&mut self) {
        if let (Some(addr), Some(session)) = (self.pending_connect.take(), &self.expected) {
            session.end_connect(addr);
        }
    }

    fn on_handshake(&mut self, handshake: Handshake) -> Result<(), PeerError> {
        let info = self
            .info
            .ok_or_else(|| PeerError::Protocol("handshake before connect".into()))?;

        let session = match &self.expected {
            Some(session) if session.info_hash() != handshake.info_hash => {
                return Err(PeerError::InfoHashMismatch);
            }
            Some(session) => Arc::clone(session),
            None => self
                .table
                .get(&handshake.info_hash)
                .ok_or(PeerError::UnknownTorrent(handshake.info_hash))?,
        };
        if handshake.peer_id == self.table.peer_id() {
            return Err(PeerError::SelfConnection);
        }

        self.table
            .registry()
            .register(handshake.info_hash, handshake.peer_id, info.id, &session)?;

        if info.direction == Direction::Inbound {
            Handshake::new(handshake.info_hash, self.table.peer_id()).encode_into(&mut self.write_buf);
        }
        if let Err(e) = session.attach_peer(&info, handshake.peer_id) {
            self.table
                .registry()
                .unregister(handshake.info_hash, handshake.peer_id, info.id);
            return Err(e);
        }

        self.release_connect();
        trace!(id = %info.id, peer = %handshake.peer_id, "handshake complete");
        self.phase = Phase::Active {
            session,
            peer_id: handshake.peer_id,
        };
        Ok(())
    }

    fn process(&mut self) -> Result<(), PeerError> {
        if let Phase::Handshaking = self.phase {
            match Handshake::parse(&mut self.read_buf)? {
                Some(handshake) => self.on_handshake(handshake)?,
                None => return Ok(()),
            }
        }

        match &self.phase {
            Phase::Active { session, peer_id } => {
                while let Some(message) = Message::parse(&mut self.read_buf)? {
                    session.handle_message(peer_id, message)?;
                }
                Ok(())
            }
            Phase::Closed => Err(PeerError::SessionStopped),
            Phase::Handshaking => Ok(()),
        }
    }

    fn teardown(&mut self) {
        self.release_connect();
        if let Phase::Active { session, peer_id } = std::mem::replace(&mut self.phase, Phase::Closed) {
            if let Some(info) = self.info {
                session.detach_peer(&peer_id, info.id);
                self.table
                    .registry()
                    .unregister(session.info_hash(), peer_id, info.id);
            }
        }
    }
}

impl ConnectionListener for PeerChannel {
    fn on_connection_established(&mut self, info: &ConnectionInfo) -> Result<(), ListenerError> {
        self.info = Some(*info);
        if let Some(session) = &self.expected {
            if session.is_stopped() {
                return Err(PeerError::SessionStopped.into());
            }
            Handshake::new(session.info_hash(), self.table.peer_id()).encode_into(&mut self.write_buf);
        }
        Ok(())
    }

    fn on_data_received(&mut self, data: &[u8]) -> Result<(), ListenerError> {
        self.read_buf.extend_from_slice(data);
        self.process().map_err(Into::into)
    }

    fn outbound(&mut self) -> &mut BytesMut {
        if let Phase::Active { session, peer_id } = &self.phase {
            session.drain_outbound(peer_id, &mut self.write_buf);
        }
        &mut self.write_buf
    }

    fn on_error(&mut self, error: &ReactorError) {
        let addr = self.info.map(|i| i.peer_addr).or(self.pending_connect);
        match self.peer_id() {
            Some(peer) => debug!(peer = %peer, ?addr, %error, "dropping peer"),
            None => debug!(?addr, %error, "peer connection failed"),
        }
        self.teardown();
    }

    fn on_disconnect(&mut self) {
        if let Some(peer) = self.peer_id() {
            debug!(peer = %peer, "peer disconnected");
        }
        self.teardown();
    }
}
