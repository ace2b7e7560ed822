use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tempfile::TempDir;

use super::*;
use crate::config::{ClientConfig, HashingConfig, ReactorConfig, SessionConfig};
use crate::metainfo::{HashingPool, Metainfo, TorrentBuilder};
use crate::peer::{Bitfield, BlockRequest, Handshake, Message, PeerError, PeerId};
use crate::reactor::{ConnectionId, Reactor};
use crate::storage::PieceStore;

const BLOCK: u32 = 16384;
/// Nothing listens here; announces fail fast.
const DEAD_TRACKER: &str = "http://127.0.0.1:9/announce";

fn bitfield(count: usize, pieces: &[usize]) -> Bitfield {
    let mut bf = Bitfield::new(count);
    for &piece in pieces {
        bf.set_piece(piece);
    }
    bf
}

fn picker(pieces: usize, endgame_threshold: usize) -> PiecePicker {
    let piece_length = 2 * BLOCK as u64;
    PiecePicker::new(
        &Bitfield::new(pieces),
        piece_length,
        piece_length * pieces as u64,
        BLOCK,
        endgame_threshold,
    )
}

fn req(piece: u32, block: u32) -> BlockRequest {
    BlockRequest::new(piece, block * BLOCK, BLOCK)
}

#[test]
fn test_picker_rarest_first() {
    let mut picker = picker(4, 0);
    let (a, b, c) = (PeerId::generate(), PeerId::generate(), PeerId::generate());
    let all = Bitfield::full(4);
    let bf_b = bitfield(4, &[0, 1, 2]);
    picker.peer_bitfield(&all);
    picker.peer_bitfield(&bf_b);
    picker.peer_bitfield(&bitfield(4, &[0, 1]));
    assert_eq!(picker.availability(3), 1);
    assert_eq!(picker.availability(0), 3);

    assert_eq!(picker.next_requests(&a, &all, 2), vec![req(3, 0), req(3, 1)]);
    assert_eq!(
        picker.next_requests(&a, &all, 3),
        vec![req(2, 0), req(2, 1), req(0, 0)]
    );
    // Blocks in flight elsewhere are skipped outside end-game.
    assert_eq!(
        picker.next_requests(&b, &bf_b, 10),
        vec![req(0, 1), req(1, 0), req(1, 1)]
    );
    assert!(picker.next_requests(&c, &bitfield(4, &[0, 1]), 10).is_empty());
}

#[test]
fn test_picker_short_last_piece() {
    let piece_length = 2 * BLOCK as u64;
    let mut picker = PiecePicker::new(&Bitfield::new(2), piece_length, piece_length + 100, BLOCK, 0);
    let peer = PeerId::generate();

    let requests = picker.next_requests(&peer, &bitfield(2, &[1]), 5);
    assert_eq!(requests, vec![BlockRequest::new(1, 0, 100)]);
}

#[test]
fn test_picker_endgame_duplicates_and_cancels() {
    let mut picker = picker(2, 10);
    let (a, b) = (PeerId::generate(), PeerId::generate());
    let all = Bitfield::full(2);
    assert!(picker.is_endgame());

    assert_eq!(picker.next_requests(&a, &all, 4).len(), 4);
    let duplicates = picker.next_requests(&b, &all, 4);
    assert_eq!(duplicates, vec![req(0, 0), req(0, 1), req(1, 0), req(1, 1)]);
    assert!(picker.next_requests(&b, &all, 4).is_empty());

    assert_eq!(
        picker.block_received(&b, &req(0, 0)),
        BlockOutcome::Accepted { cancel: vec![a] }
    );
    assert_eq!(picker.block_received(&a, &req(0, 0)), BlockOutcome::Duplicate);
    assert_eq!(picker.block_status(&req(0, 0)), Some(&BlockStatus::Received));
}

#[test]
fn test_picker_rejects_blocks_off_the_grid() {
    let mut picker = picker(2, 0);
    let peer = PeerId::generate();

    assert_eq!(
        picker.block_received(&peer, &BlockRequest::new(0, 100, BLOCK)),
        BlockOutcome::Invalid
    );
    assert_eq!(
        picker.block_received(&peer, &BlockRequest::new(0, 0, 10)),
        BlockOutcome::Invalid
    );
    assert_eq!(picker.block_received(&peer, &req(5, 0)), BlockOutcome::Invalid);
    // Unrequested but well-formed data is taken.
    assert_eq!(
        picker.block_received(&peer, &req(1, 1)),
        BlockOutcome::Accepted { cancel: vec![] }
    );
}

#[test]
fn test_picker_failed_piece_is_requested_again() {
    let mut picker = picker(2, 0);
    let (a, b) = (PeerId::generate(), PeerId::generate());
    let all = Bitfield::full(2);

    picker.next_requests(&a, &all, 1);
    picker.next_requests(&b, &all, 1);
    picker.block_received(&a, &req(0, 0));
    picker.block_received(&b, &req(0, 1));

    let contributors: HashSet<PeerId> = picker.piece_failed(0).into_iter().collect();
    assert_eq!(contributors, HashSet::from([a, b]));
    assert_eq!(picker.missing(), 2);
    assert_eq!(picker.next_requests(&a, &all, 2), vec![req(0, 0), req(0, 1)]);

    picker.piece_verified(1);
    assert_eq!(picker.missing(), 1);
    assert!(picker.piece_failed(1).is_empty());
    assert!(!picker.interesting(&bitfield(2, &[1])));
}

#[test]
fn test_picker_releases_blocks_of_departed_peer() {
    let mut picker = picker(1, 0);
    let (a, b) = (PeerId::generate(), PeerId::generate());
    let all = Bitfield::full(1);
    picker.peer_bitfield(&all);

    let in_flight = picker.next_requests(&a, &all, 2);
    assert!(picker.next_requests(&b, &all, 2).is_empty());

    picker.peer_gone(&a, &all, &in_flight);
    assert_eq!(picker.availability(0), 0);
    assert_eq!(picker.next_requests(&b, &all, 2), in_flight);
}

/// A data file of `len` bytes and its descriptor.
fn torrent(dir: &Path, len: usize, piece_length: u64) -> Metainfo {
    let data: Vec<u8> = (0..len).map(|i| (i * 31 % 253) as u8).collect();
    let file = dir.join("payload.bin");
    fs::write(&file, data).unwrap();
    TorrentBuilder::new(&file)
        .announce(DEAD_TRACKER)
        .piece_length(piece_length)
        .hashing(HashingConfig::default().with_threads(2))
        .build_metainfo()
        .unwrap()
}

/// A session over `torrent` that never runs its reactor.
fn idle_session(temp: &TempDir) -> (Reactor, Arc<TorrentSession>) {
    let metainfo = torrent(temp.path(), 40_000, 16384);
    let store = Arc::new(PieceStore::open(temp.path().join("out"), &metainfo).unwrap());
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let pool = Arc::new(HashingPool::new(&HashingConfig::default().with_threads(1)).unwrap());
    let session = TorrentSession::new(
        metainfo,
        store,
        SessionConfig::default(),
        reactor.handle(),
        pool,
    );
    (reactor, session)
}

#[test]
fn test_registry_allows_one_connection_per_peer() {
    let temp = TempDir::new().unwrap();
    let (_reactor, session) = idle_session(&temp);
    let registry = PeerRegistry::new();
    let info_hash = session.info_hash();
    let peer = PeerId::generate();

    registry.register(info_hash, peer, ConnectionId(1), &session).unwrap();
    assert!(matches!(
        registry.register(info_hash, peer, ConnectionId(2), &session),
        Err(PeerError::DuplicatePeer(_))
    ));
    registry
        .register(info_hash, PeerId::generate(), ConnectionId(3), &session)
        .unwrap();
    assert_eq!(registry.len(), 2);

    registry.unregister(info_hash, peer, ConnectionId(2));
    assert_eq!(registry.connection(info_hash, peer), Some(ConnectionId(1)));
    registry.unregister(info_hash, peer, ConnectionId(1));
    assert!(!registry.is_connected(info_hash, peer));
}

#[test]
fn test_registry_replaces_entries_of_dropped_sessions() {
    let temp = TempDir::new().unwrap();
    let (reactor, session) = idle_session(&temp);
    let registry = PeerRegistry::new();
    let info_hash = session.info_hash();
    let peer = PeerId::generate();
    registry.register(info_hash, peer, ConnectionId(1), &session).unwrap();
    drop(session);

    let temp2 = TempDir::new().unwrap();
    let (_reactor2, fresh) = idle_session(&temp2);
    registry.register(info_hash, peer, ConnectionId(2), &fresh).unwrap();
    assert_eq!(registry.connection(info_hash, peer), Some(ConnectionId(2)));
    drop(reactor);
}

#[test]
fn test_session_table_rejects_second_copy() {
    let temp = TempDir::new().unwrap();
    let (_reactor, session) = idle_session(&temp);
    let table = SessionTable::new(PeerId::generate());

    assert!(table.insert(Arc::clone(&session)));
    assert!(!table.insert(Arc::clone(&session)));
    assert_eq!(table.len(), 1);
    assert!(table.get(&session.info_hash()).is_some());
    assert!(table.remove(&session.info_hash()).is_some());
    assert!(table.is_empty());
}

#[test]
fn test_connect_slots_respect_peer_limit() {
    let temp = TempDir::new().unwrap();
    let metainfo = torrent(temp.path(), 1000, 16384);
    let store = Arc::new(PieceStore::open(temp.path().join("out"), &metainfo).unwrap());
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let pool = Arc::new(HashingPool::new(&HashingConfig::default().with_threads(1)).unwrap());
    let session = TorrentSession::new(
        metainfo,
        store,
        SessionConfig::default().with_max_peers(2),
        reactor.handle(),
        pool,
    );

    let addr = |port| SocketAddr::from(([127, 0, 0, 1], port));
    assert!(session.begin_connect(addr(1)));
    assert!(!session.begin_connect(addr(1)));
    assert!(session.begin_connect(addr(2)));
    assert!(!session.begin_connect(addr(3)));
    session.end_connect(addr(1));
    assert!(session.begin_connect(addr(3)));

    session.stop();
    assert!(session.is_stopped());
    assert_eq!(session.connecting_count(), 0);
    assert!(!session.begin_connect(addr(4)));
}

fn client_config() -> ClientConfig {
    ClientConfig::default()
        .with_listen_addr("127.0.0.1:0".parse().unwrap())
        .with_hashing(HashingConfig::default().with_threads(2))
        .with_reactor(ReactorConfig::default().with_connect_timeout(Duration::from_secs(2)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_seed_to_leech_transfer() {
    let seed_dir = TempDir::new().unwrap();
    let leech_dir = TempDir::new().unwrap();
    let metainfo = torrent(seed_dir.path(), 300_000, 32768);
    let info_hash = metainfo.info_hash;

    let seeder = Client::start(client_config()).unwrap();
    let seeded = seeder.add_torrent(metainfo.clone(), seed_dir.path()).await.unwrap();
    assert!(seeded.is_complete());

    let leecher = Client::start(client_config()).unwrap();
    let leeching = leecher.add_torrent(metainfo, leech_dir.path()).await.unwrap();
    assert!(!leeching.is_complete());
    assert_eq!(leeching.transfer_stats().left, 300_000);

    let mut completion = leeching.subscribe_completion();
    leecher.connect(&info_hash, seeder.local_addr()).unwrap();
    tokio::time::timeout(Duration::from_secs(30), completion.wait_for(|done| *done))
        .await
        .expect("download timed out")
        .unwrap();

    assert!(leeching.is_complete());
    assert_eq!(leeching.transfer_stats().left, 0);
    assert_eq!(leeching.transfer_stats().downloaded, 300_000);
    assert_eq!(
        fs::read(leech_dir.path().join("payload.bin")).unwrap(),
        fs::read(seed_dir.path().join("payload.bin")).unwrap()
    );

    leecher.stop().await.unwrap();
    seeder.stop().await.unwrap();
}

/// Opens a raw peer connection and completes the handshake. Returns the
/// stream positioned after the remote handshake.
fn raw_peer(addr: SocketAddr, info_hash: crate::metainfo::InfoHash, peer_id: PeerId) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream
        .write_all(&Handshake::new(info_hash, peer_id).encode())
        .unwrap();
    let mut reply = [0u8; 68];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(Handshake::decode(&reply).unwrap().info_hash, info_hash);
    stream
}

/// Reads until the remote closes. Returns `false` on timeout.
fn closed_by_remote(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                return false;
            }
            Err(_) => return true,
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_bitfield_drops_only_that_peer() {
    let dir = TempDir::new().unwrap();
    let metainfo = torrent(dir.path(), 100_000, 32768);
    let info_hash = metainfo.info_hash;
    let pieces = metainfo.info.piece_count();

    let seeder = Client::start(client_config()).unwrap();
    let session = seeder.add_torrent(metainfo, dir.path()).await.unwrap();
    let addr = seeder.local_addr();

    let mut bystander = tokio::task::spawn_blocking(move || raw_peer(addr, info_hash, PeerId::generate()))
        .await
        .unwrap();
    let mut offender = tokio::task::spawn_blocking(move || raw_peer(addr, info_hash, PeerId::generate()))
        .await
        .unwrap();
    assert!(wait_until(|| session.peer_count() == 2).await);

    let bits = Message::Bitfield(Bitfield::full(pieces).to_bytes()).encode();
    offender.write_all(&bits).unwrap();
    offender.write_all(&bits).unwrap();
    let closed = tokio::task::spawn_blocking(move || closed_by_remote(&mut offender))
        .await
        .unwrap();
    assert!(closed);

    assert!(wait_until(|| session.peer_count() == 1).await);
    assert!(!session.is_stopped());
    bystander.write_all(&Message::KeepAlive.encode()).unwrap();
    bystander.write_all(&bits).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.peer_count(), 1);

    seeder.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_peer_connection_is_closed() {
    let dir = TempDir::new().unwrap();
    let metainfo = torrent(dir.path(), 50_000, 32768);
    let info_hash = metainfo.info_hash;

    let seeder = Client::start(client_config()).unwrap();
    let session = seeder.add_torrent(metainfo, dir.path()).await.unwrap();
    let addr = seeder.local_addr();
    let peer_id = PeerId::generate();

    let _first = tokio::task::spawn_blocking(move || raw_peer(addr, info_hash, peer_id))
        .await
        .unwrap();
    assert!(wait_until(|| session.peer_count() == 1).await);

    let closed = tokio::task::spawn_blocking(move || {
        let mut second = TcpStream::connect(addr).unwrap();
        second.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        second
            .write_all(&Handshake::new(info_hash, peer_id).encode())
            .unwrap();
        let mut buf = [0u8; 68];
        let got_handshake = second.read_exact(&mut buf).is_ok();
        !got_handshake && closed_by_remote(&mut second)
    })
    .await
    .unwrap();
    assert!(closed);
    assert_eq!(session.peer_count(), 1);

    seeder.stop().await.unwrap();
}

/// Answers every request with filler bytes until the remote hangs up.
/// Returns the number of requests answered and whether the remote closed.
fn answer_with_filler(stream: &mut TcpStream) -> (usize, bool) {
    let mut buf = BytesMut::with_capacity(1 << 16);
    let mut chunk = [0u8; 4096];
    let mut answered = 0;
    loop {
        loop {
            match Message::parse(&mut buf) {
                Ok(Some(Message::Request { index, begin, length })) => {
                    let reply = Message::Piece {
                        index,
                        begin,
                        data: Bytes::from(vec![0xAA; length as usize]),
                    };
                    if stream.write_all(&reply.encode()).is_err() {
                        return (answered, true);
                    }
                    answered += 1;
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => return (answered, false),
            }
        }
        match stream.read(&mut chunk) {
            Ok(0) => return (answered, true),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                return (answered, false);
            }
            Err(_) => return (answered, true),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_corrupt_piece_drops_sender() {
    let data_dir = TempDir::new().unwrap();
    let leech_dir = TempDir::new().unwrap();
    let metainfo = torrent(data_dir.path(), 32768, 32768);
    let info_hash = metainfo.info_hash;
    let pieces = metainfo.info.piece_count();

    let leecher = Client::start(client_config()).unwrap();
    let session = leecher.add_torrent(metainfo, leech_dir.path()).await.unwrap();
    assert!(!session.is_complete());
    let addr = leecher.local_addr();

    let mut liar = tokio::task::spawn_blocking(move || raw_peer(addr, info_hash, PeerId::generate()))
        .await
        .unwrap();
    assert!(wait_until(|| session.peer_count() == 1).await);

    liar.write_all(&Message::Bitfield(Bitfield::full(pieces).to_bytes()).encode())
        .unwrap();
    liar.write_all(&Message::Unchoke.encode()).unwrap();
    let (answered, closed) = tokio::task::spawn_blocking(move || answer_with_filler(&mut liar))
        .await
        .unwrap();
    assert!(closed);
    assert!(answered >= 2);

    assert!(wait_until(|| session.peer_count() == 0).await);
    assert_eq!(session.store().verified_count(), 0);
    assert!(!session.is_complete());
    assert!(!session.is_stopped());

    leecher.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_self_connection_is_rejected() {
    let dir = TempDir::new().unwrap();
    let metainfo = torrent(dir.path(), 50_000, 32768);
    let info_hash = metainfo.info_hash;

    let client = Client::start(client_config()).unwrap();
    let session = client.add_torrent(metainfo, dir.path()).await.unwrap();
    client.connect(&info_hash, client.local_addr()).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(wait_until(|| session.connecting_count() == 0 && session.peer_count() == 0).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.peer_count(), 0);
    assert!(!session.is_stopped());

    client.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_info_hash_gets_no_handshake() {
    let dir = TempDir::new().unwrap();
    let metainfo = torrent(dir.path(), 50_000, 32768);

    let client = Client::start(client_config()).unwrap();
    let session = client.add_torrent(metainfo, dir.path()).await.unwrap();
    let addr = client.local_addr();

    let closed = tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let unknown = crate::metainfo::InfoHash::new([9; 20]);
        stream
            .write_all(&Handshake::new(unknown, PeerId::generate()).encode())
            .unwrap();
        let mut buf = [0u8; 68];
        let got_handshake = stream.read_exact(&mut buf).is_ok();
        !got_handshake && closed_by_remote(&mut stream)
    })
    .await
    .unwrap();
    assert!(closed);
    assert_eq!(session.peer_count(), 0);

    client.stop().await.unwrap();
}
