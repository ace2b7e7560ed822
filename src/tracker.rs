//! HTTP tracker client (BEP-3, BEP-23, BEP-48 scrape)
//!
//! [`HttpTracker`] performs single announce and scrape requests.
//! [`Announcer`] runs the periodic cycle for one torrent: `started`, regular
//! announces at the tracker's interval, `completed` once and `stopped` on
//! shutdown, backing off exponentially while trackers are unreachable.

mod announcer;
mod error;
mod http;
mod response;

pub use announcer::{Announcer, SwarmMember, TransferStats};
pub use error::TrackerError;
pub use http::{scrape_url, HttpTracker};
pub use response::{
    parse_compact_peers, parse_compact_peers6, AnnounceRequest, AnnounceResponse, CompactPeer,
    ScrapeFile, ScrapeResponse, TrackerEvent,
};

pub(crate) use http::url_encode;
