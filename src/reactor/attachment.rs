use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::Interest;
use mio::net::{TcpListener, TcpStream};

use super::listener::{ConnectionInfo, ConnectionListener, ListenerFactory};

/// What a registered socket is doing. Each variant owns its socket.
pub(crate) enum Attachment {
    Accept(AcceptAttachment),
    Connect(ConnectAttachment),
    ReadWrite(ReadWriteAttachment),
}

pub(crate) struct AcceptAttachment {
    pub socket: TcpListener,
    pub factory: Box<dyn ListenerFactory>,
}

pub(crate) struct ConnectAttachment {
    pub stream: TcpStream,
    pub target: SocketAddr,
    pub listener: Box<dyn ConnectionListener>,
    pub started: Instant,
    pub timeout: Duration,
}

impl ConnectAttachment {
    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.timeout
    }
}

pub(crate) struct ReadWriteAttachment {
    pub stream: TcpStream,
    pub info: ConnectionInfo,
    pub listener: Box<dyn ConnectionListener>,
    /// Last time the peer sent us anything.
    pub last_activity: Instant,
    pub timeout: Duration,
    pub interest: Interest,
    /// Set when a read stopped early (throttle or fairness cap) and must be
    /// retried without a new readiness event.
    pub read_deferred: bool,
}

impl ReadWriteAttachment {
    pub fn idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) >= self.timeout
    }
}
