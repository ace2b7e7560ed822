use std::fmt;
use std::net::SocketAddr;

use bytes::BytesMut;

use super::error::{ListenerError, ReactorError};

/// Identifies one registration for the lifetime of the reactor. Ids are
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) usize);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub direction: Direction,
}

/// Callbacks for one connection, invoked on the reactor thread.
///
/// Returning `Err` from `on_connection_established` or `on_data_received`
/// closes the connection; the listener then sees `on_error` with
/// [`ReactorError::Rejected`]. After `on_error` or `on_disconnect` no further
/// callbacks arrive.
pub trait ConnectionListener: Send {
    fn on_connection_established(&mut self, info: &ConnectionInfo) -> Result<(), ListenerError>;

    fn on_data_received(&mut self, data: &[u8]) -> Result<(), ListenerError>;

    /// Bytes waiting to be written. The reactor drains what the socket
    /// accepts and keeps write interest while anything remains.
    fn outbound(&mut self) -> &mut BytesMut;

    fn on_error(&mut self, error: &ReactorError);

    fn on_disconnect(&mut self);
}

/// Creates listeners for accepted connections. Returning `None` refuses the
/// connection.
pub trait ListenerFactory: Send {
    fn new_listener(&mut self, peer_addr: SocketAddr) -> Option<Box<dyn ConnectionListener>>;
}

impl<F> ListenerFactory for F
where
    F: FnMut(SocketAddr) -> Option<Box<dyn ConnectionListener>> + Send,
{
    fn new_listener(&mut self, peer_addr: SocketAddr) -> Option<Box<dyn ConnectionListener>> {
        self(peer_addr)
    }
}
