//! Runtime configuration.
//!
//! Every component takes an immutable configuration struct at construction.
//! Defaults come from [`crate::constants`]; the only environment lookup in the
//! crate is [`HashingConfig::from_env`], which callers invoke explicitly.
//!
//! ```
//! use bitswarm::config::{ClientConfig, HashingConfig};
//! use std::time::Duration;
//!
//! let hashing = HashingConfig::default().with_threads(2);
//! let client = ClientConfig::default()
//!     .with_listen_addr("127.0.0.1:0".parse().unwrap())
//!     .with_hashing(hashing);
//! assert_eq!(client.hashing.threads, 2);
//! assert_eq!(client.session.pipeline_depth, 5);
//! ```

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use crate::constants::{
    BLOCK_SIZE, CHOKING_INTERVAL, CONNECTION_TIMEOUT, DEFAULT_PORT, DEFAULT_TRACKER_PORT,
    ENDGAME_PIECES_THRESHOLD, HASHING_THREADS_ENV, HASHING_TIMEOUT, IDLE_TIMEOUT,
    MAX_PEERS_PER_REPLY, MAX_PEERS_PER_TORRENT, MAX_UNCHOKED_PEERS, PEER_EXPIRY, PIPELINE_DEPTH,
    SELECT_TIMEOUT, SERVER_ANNOUNCE_INTERVAL, SERVER_MIN_INTERVAL,
};

/// Piece hashing pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashingConfig {
    /// Worker thread count; also the number of digests in flight before draining.
    pub threads: usize,
    /// Longest wait for a single piece digest.
    pub task_timeout: Duration,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            task_timeout: HASHING_TIMEOUT,
        }
    }
}

impl HashingConfig {
    /// Defaults, with the thread count taken from `TTORRENT_HASHING_THREADS`
    /// when it holds a positive integer.
    pub fn from_env() -> Self {
        Self::default().with_env_override(std::env::var(HASHING_THREADS_ENV).ok().as_deref())
    }

    /// Applies a raw `TTORRENT_HASHING_THREADS` value. Anything other than a
    /// positive integer leaves the thread count unchanged.
    pub fn with_env_override(self, value: Option<&str>) -> Self {
        match value.map(str::trim).and_then(|v| v.parse::<usize>().ok()) {
            Some(threads) if threads > 0 => self.with_threads(threads),
            _ => self,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }
}

/// Connection reactor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorConfig {
    /// Upper bound on one selector wait; also the sweep granularity.
    pub select_timeout: Duration,
    /// Outbound connect attempts older than this fail with a timeout.
    pub connect_timeout: Duration,
    /// Established connections with no traffic for this long are closed.
    pub idle_timeout: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            select_timeout: SELECT_TIMEOUT,
            connect_timeout: CONNECTION_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
        }
    }
}

impl ReactorConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }
}

/// Per-torrent transfer policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Connected plus connecting peers.
    pub max_peers: usize,
    /// Outstanding block requests per peer.
    pub pipeline_depth: usize,
    pub block_size: u32,
    /// Missing pieces below which end-game starts.
    pub endgame_threshold: usize,
    /// Upload slots.
    pub max_unchoked: usize,
    pub rechoke_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_peers: MAX_PEERS_PER_TORRENT,
            pipeline_depth: PIPELINE_DEPTH,
            block_size: BLOCK_SIZE,
            endgame_threshold: ENDGAME_PIECES_THRESHOLD,
            max_unchoked: MAX_UNCHOKED_PEERS,
            rechoke_interval: CHOKING_INTERVAL,
        }
    }
}

impl SessionConfig {
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth.max(1);
        self
    }

    pub fn with_endgame_threshold(mut self, threshold: usize) -> Self {
        self.endgame_threshold = threshold;
        self
    }

    pub fn with_max_unchoked(mut self, slots: usize) -> Self {
        self.max_unchoked = slots;
        self
    }
}

/// Settings for a seeding/leeching client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Address of the inbound peer listener.
    pub listen_addr: SocketAddr,
    /// Port reported to trackers; defaults to the bound listener port.
    pub announce_port: Option<u16>,
    pub reactor: ReactorConfig,
    pub session: SessionConfig,
    pub hashing: HashingConfig,
    /// Download cap in bytes per second; 0 is unlimited.
    pub download_rate: u64,
    /// Upload cap in bytes per second; 0 is unlimited.
    pub upload_rate: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            announce_port: None,
            reactor: ReactorConfig::default(),
            session: SessionConfig::default(),
            hashing: HashingConfig::default(),
            download_rate: 0,
            upload_rate: 0,
        }
    }
}

impl ClientConfig {
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_announce_port(mut self, port: u16) -> Self {
        self.announce_port = Some(port);
        self
    }

    pub fn with_reactor(mut self, reactor: ReactorConfig) -> Self {
        self.reactor = reactor;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_hashing(mut self, hashing: HashingConfig) -> Self {
        self.hashing = hashing;
        self
    }

    pub fn with_rate_limits(mut self, download: u64, upload: u64) -> Self {
        self.download_rate = download;
        self.upload_rate = upload;
        self
    }
}

/// Tracker server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    pub bind_addr: SocketAddr,
    /// `interval` advertised in announce replies.
    pub announce_interval: Duration,
    /// `min interval` advertised in announce replies.
    pub min_interval: Duration,
    /// Peers silent for longer than this are dropped.
    pub peer_expiry: Duration,
    /// Sweeper period; `None` disables the sweeper task.
    pub sweep_interval: Option<Duration>,
    /// Drop a torrent once its last peer expires.
    pub remove_peerless_torrents: bool,
    pub max_peers_per_reply: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_TRACKER_PORT)),
            announce_interval: SERVER_ANNOUNCE_INTERVAL,
            min_interval: SERVER_MIN_INTERVAL,
            peer_expiry: PEER_EXPIRY,
            sweep_interval: Some(PEER_EXPIRY),
            remove_peerless_torrents: true,
            max_peers_per_reply: MAX_PEERS_PER_REPLY,
        }
    }
}

impl TrackerConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self.min_interval = self.min_interval.min(interval);
        self
    }

    /// Sets the expiry and, unless already customised, sweeps at the same period.
    pub fn with_peer_expiry(mut self, expiry: Duration) -> Self {
        if self.sweep_interval == Some(self.peer_expiry) {
            self.sweep_interval = Some(expiry);
        }
        self.peer_expiry = expiry;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_remove_peerless_torrents(mut self, remove: bool) -> Self {
        self.remove_peerless_torrents = remove;
        self
    }
}
