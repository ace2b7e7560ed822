//! Protocol constants and tuning defaults.
//!
//! Values that callers may want to change at runtime are copied into the
//! structs of [`crate::config`]; the rest are fixed by the wire protocol.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Azureus-style client tag placed at the start of every generated peer id
pub const CLIENT_PREFIX: &[u8; 8] = b"-BS0100-";

/// Value written to the `created by` field of new torrents
pub const CREATED_BY: &str = concat!("bitswarm ", env!("CARGO_PKG_VERSION"));

/// User agent for tracker requests
pub const USER_AGENT: &str = concat!("bitswarm/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Ports
// ============================================================================

/// Default peer listen port
pub const DEFAULT_PORT: u16 = 6881;

/// Default tracker port
pub const DEFAULT_TRACKER_PORT: u16 = 6969;

// ============================================================================
// Metainfo and hashing
// ============================================================================

/// Default piece length for new torrents (512 KiB)
pub const DEFAULT_PIECE_LENGTH: u64 = 512 * 1024;

/// Environment variable overriding the hashing pool size
pub const HASHING_THREADS_ENV: &str = "TTORRENT_HASHING_THREADS";

/// Longest wait for any single piece digest before a build is aborted
pub const HASHING_TIMEOUT: Duration = Duration::from_secs(15);

/// Length of a SHA-1 digest
pub const DIGEST_LEN: usize = 20;

// ============================================================================
// Block and piece transfer
// ============================================================================

/// Standard block size (16 KiB)
pub const BLOCK_SIZE: u32 = 16384;

/// Largest block we serve; longer requests are refused (BEP-3 recommends 128 KiB)
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Outstanding block requests per peer
pub const PIPELINE_DEPTH: usize = 5;

/// Missing pieces below which end-game duplicate requests are allowed
pub const ENDGAME_PIECES_THRESHOLD: usize = 10;

/// Maximum frame length accepted on the wire (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Bytes of piece data staged in a channel's write buffer before more uploads are read
pub const UPLOAD_HIGH_WATER: usize = 4 * BLOCK_SIZE as usize;

// ============================================================================
// Connection limits
// ============================================================================

/// Connected plus connecting peers per torrent
pub const MAX_PEERS_PER_TORRENT: usize = 50;

/// Peers we keep unchoked for uploads
pub const MAX_UNCHOKED_PEERS: usize = 4;

// ============================================================================
// Reactor timing
// ============================================================================

/// Upper bound on a single selector wait
pub const SELECT_TIMEOUT: Duration = Duration::from_millis(100);

/// TCP connect timeout
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle timeout for established connections
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Bytes read from a socket per syscall
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Keep-alive is sent after this long without other outbound traffic
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Intervals - Choking
// ============================================================================

/// Choking algorithm run interval
pub const CHOKING_INTERVAL: Duration = Duration::from_secs(10);

/// Rechoke rounds between optimistic unchoke rotations
pub const OPTIMISTIC_UNCHOKE_ROUNDS: u32 = 3;

// ============================================================================
// Tracker client
// ============================================================================

/// HTTP tracker request timeout
pub const HTTP_TRACKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Announce interval used until a tracker tells us otherwise
pub const TRACKER_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

/// Jitter applied to announce intervals, as a fraction
pub const ANNOUNCE_JITTER: f64 = 0.10;

/// Base delay for tracker retry backoff
pub const TRACKER_RETRY_BASE_DELAY: Duration = Duration::from_secs(5);

/// Backoff exponent cap for retries
pub const BACKOFF_EXPONENT_CAP: u32 = 6;

/// Peers requested from the tracker per announce
pub const DEFAULT_NUMWANT: u32 = 50;

// ============================================================================
// Tracker server
// ============================================================================

/// Interval advertised to announcing clients
pub const SERVER_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

/// Minimum interval advertised to announcing clients
pub const SERVER_MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Peers silent for longer than this are evicted from a swarm
pub const PEER_EXPIRY: Duration = Duration::from_secs(2 * 1800);

/// Upper bound on peers returned in one announce reply
pub const MAX_PEERS_PER_REPLY: usize = 50;

// ============================================================================
// Protocol constants
// ============================================================================

/// BitTorrent protocol string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Reserved handshake bytes; we advertise no extensions
pub const RESERVED_BYTES: [u8; 8] = [0; 8];

/// Handshake length: pstrlen + pstr + reserved + info-hash + peer id
pub const HANDSHAKE_LEN: usize = 68;
