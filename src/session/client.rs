use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::table::SessionTable;
use super::torrent::TorrentSession;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::metainfo::{HashingPool, InfoHash, Metainfo};
use crate::peer::{PeerChannel, PeerId};
use crate::reactor::{ConnectionListener, Reactor, ReactorHandle};
use crate::storage::{PieceStore, StorageError};
use crate::throttle::BandwidthLimiter;
use crate::tracker::{Announcer, SwarmMember, TrackerError, TransferStats};

/// A seeding and leeching client.
///
/// Owns the reactor thread, the hashing pool and the table of torrent
/// sessions, plus one announcer and one rechoke timer per torrent on the
/// ambient tokio runtime.
///
/// ```no_run
/// use bitswarm::config::ClientConfig;
/// use bitswarm::metainfo::Metainfo;
/// use bitswarm::session::Client;
///
/// # async fn run() -> bitswarm::Result<()> {
/// let client = Client::start(ClientConfig::default())?;
/// let metainfo = Metainfo::from_file("example.torrent")?;
/// let session = client.add_torrent(metainfo, "downloads").await?;
/// session.subscribe_completion().wait_for(|done| *done).await.ok();
/// client.stop().await
/// # }
/// ```
pub struct Client {
    config: ClientConfig,
    table: Arc<SessionTable>,
    reactor: ReactorHandle,
    reactor_thread: Option<JoinHandle<io::Result<()>>>,
    pool: Arc<HashingPool>,
    local_addr: SocketAddr,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Client {
    /// Binds the peer listener and starts the reactor thread and hashing pool.
    pub fn start(config: ClientConfig) -> Result<Self> {
        let table = Arc::new(SessionTable::new(PeerId::generate()));
        let limiter = BandwidthLimiter::new(config.download_rate, config.upload_rate);
        let mut reactor = Reactor::new(config.reactor.clone())?.with_throttle(Arc::new(limiter));

        let inbound_table = Arc::clone(&table);
        let local_addr = reactor.listen(
            config.listen_addr,
            move |addr: SocketAddr| -> Option<Box<dyn ConnectionListener>> {
                trace!(%addr, "accepted peer connection");
                Some(Box::new(PeerChannel::inbound(Arc::clone(&inbound_table))))
            },
        )?;

        let handle = reactor.handle();
        let reactor_thread = reactor.spawn()?;
        let pool = match HashingPool::new(&config.hashing) {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                handle.shutdown();
                return Err(e.into());
            }
        };

        info!(%local_addr, peer_id = %table.peer_id(), "client started");
        Ok(Self {
            config,
            table,
            reactor: handle,
            reactor_thread: Some(reactor_thread),
            pool,
            local_addr,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.table.peer_id()
    }

    /// Address of the inbound peer listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session(&self, info_hash: &InfoHash) -> Option<Arc<TorrentSession>> {
        self.table.get(info_hash)
    }

    pub fn sessions(&self) -> Vec<Arc<TorrentSession>> {
        self.table.sessions()
    }

    /// Adds a torrent whose files live under `dir`.
    ///
    /// Existing data is rechecked first, so a complete copy seeds at once.
    /// The torrent then joins its swarm through its trackers; a torrent with
    /// no usable tracker only talks to peers passed to [`connect`](Self::connect)
    /// or connecting to us.
    pub async fn add_torrent(&self, metainfo: Metainfo, dir: impl Into<PathBuf>) -> Result<Arc<TorrentSession>> {
        let info_hash = metainfo.info_hash;
        if self.table.get(&info_hash).is_some() {
            return Err(Error::DuplicateTorrent(info_hash));
        }

        let store = Arc::new(PieceStore::open(dir.into(), &metainfo)?);
        let checked = Arc::clone(&store);
        let pool = Arc::clone(&self.pool);
        let verified = tokio::task::spawn_blocking(move || -> std::result::Result<usize, StorageError> {
            let verified = checked.recheck(&pool)?;
            checked.preallocate()?;
            Ok(verified)
        })
        .await
        .map_err(io::Error::other)??;

        let session = TorrentSession::new(
            metainfo,
            store,
            self.config.session.clone(),
            self.reactor.clone(),
            Arc::clone(&self.pool),
        );
        if !self.table.insert(Arc::clone(&session)) {
            return Err(Error::DuplicateTorrent(info_hash));
        }
        info!(
            torrent = %session.name(),
            %info_hash,
            verified,
            pieces = session.store().piece_count(),
            "torrent added"
        );

        let mut tasks = Vec::with_capacity(2);
        tasks.push(self.spawn_rechoke(&session));
        match self.announcer(&session) {
            Ok(announcer) => {
                let run = announcer.run(session.subscribe_completion(), session.subscribe_stop());
                tasks.push(tokio::spawn(run));
            }
            Err(e) => warn!(torrent = %session.name(), error = %e, "not announcing"),
        }
        self.tasks.lock().extend(tasks);

        Ok(session)
    }

    /// Connects `info_hash`'s session to a peer directly.
    pub fn connect(&self, info_hash: &InfoHash, addr: SocketAddr) -> Result<()> {
        let session = self
            .table
            .get(info_hash)
            .ok_or(Error::UnknownTorrent(*info_hash))?;
        let table = Arc::clone(&self.table);
        self.reactor.execute(move || {
            session.connect_peers(&table, [addr]);
        })?;
        Ok(())
    }

    /// Stops one torrent; its announcer sends `stopped`.
    pub fn remove_torrent(&self, info_hash: &InfoHash) -> Option<Arc<TorrentSession>> {
        let session = self.table.remove(info_hash)?;
        session.stop();
        Some(session)
    }

    /// Stops every session, waits for the final announces and joins the
    /// reactor thread.
    pub async fn stop(mut self) -> Result<()> {
        for session in self.table.sessions() {
            session.stop();
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "client task ended abnormally");
            }
        }

        self.reactor.shutdown();
        if let Some(thread) = self.reactor_thread.take() {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(io::Error::other)?
                .map_err(|_| io::Error::other("reactor thread panicked"))??;
        }
        info!("client stopped");
        Ok(())
    }

    fn spawn_rechoke(&self, session: &Arc<TorrentSession>) -> tokio::task::JoinHandle<()> {
        let session = Arc::clone(session);
        let reactor = self.reactor.clone();
        let mut stop = session.subscribe_stop();
        let period = session.config().rechoke_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            while !*stop.borrow() {
                tokio::select! {
                    _ = ticker.tick() => {
                        let session = Arc::clone(&session);
                        if reactor.execute(move || session.rechoke()).is_err() {
                            break;
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn announcer(&self, session: &Arc<TorrentSession>) -> std::result::Result<Announcer, TrackerError> {
        let member = Arc::new(SwarmLink {
            session: Arc::clone(session),
            table: Arc::clone(&self.table),
            reactor: self.reactor.clone(),
        });
        Announcer::new(
            session.metainfo().trackers().as_slice(),
            session.info_hash(),
            self.table.peer_id(),
            self.config.announce_port.unwrap_or(self.local_addr.port()),
            member,
        )
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.reactor_thread.is_some() {
            for session in self.table.sessions() {
                session.stop();
            }
            self.reactor.shutdown();
        }
    }
}

/// Connects the announcer of one torrent to its session.
struct SwarmLink {
    session: Arc<TorrentSession>,
    table: Arc<SessionTable>,
    reactor: ReactorHandle,
}

impl SwarmMember for SwarmLink {
    fn transfer_stats(&self) -> TransferStats {
        self.session.transfer_stats()
    }

    fn on_peers(&self, peers: Vec<SocketAddr>) {
        if peers.is_empty() || self.session.is_stopped() {
            return;
        }
        let session = Arc::clone(&self.session);
        let table = Arc::clone(&self.table);
        if let Err(e) = self.reactor.execute(move || {
            session.connect_peers(&table, peers);
        }) {
            debug!(error = %e, "dropping tracker peers");
        }
    }
}
