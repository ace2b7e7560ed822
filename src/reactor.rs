//! Single-threaded non-blocking connection reactor.
//!
//! One dedicated thread owns a [`mio::Poll`] and every socket registered with
//! it: listening sockets, pending outbound connects and established
//! connections. Each registration carries an attachment that decides what a
//! readiness event means for it, and every established connection is driven
//! by a [`ConnectionListener`].
//!
//! Other threads talk to the reactor through a cloneable [`ReactorHandle`]:
//! they queue connects, closes or arbitrary closures, and the handle wakes
//! the selector so the work runs on the next tick. A tick is:
//!
//! 1. stop if shutdown was requested,
//! 2. wait for readiness (bounded by the select timeout),
//! 3. dispatch ready events,
//! 4. run queued tasks,
//! 5. sweep: fail expired connects, close idle connections, retry throttled
//!    reads, flush pending output.
//!
//! Every registration receives exactly one terminal callback: either
//! [`ConnectionListener::on_error`] or [`ConnectionListener::on_disconnect`].
//!
//! # Example
//!
//! ```no_run
//! use bitswarm::config::ReactorConfig;
//! use bitswarm::reactor::Reactor;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let reactor = Reactor::new(ReactorConfig::default())?;
//! let handle = reactor.handle();
//! let thread = reactor.spawn()?;
//!
//! handle.execute(|| println!("running on the reactor thread"))?;
//! handle.shutdown();
//! thread.join().map_err(|_| "reactor panicked")??;
//! # Ok(())
//! # }
//! ```

mod attachment;
mod error;
mod event_loop;
mod listener;

pub use error::{ListenerError, ReactorError};
pub use event_loop::{Reactor, ReactorHandle};
pub use listener::{ConnectionId, ConnectionInfo, ConnectionListener, Direction, ListenerFactory};

#[cfg(test)]
mod tests;
