use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use rstest::rstest;

use super::*;
use crate::metainfo::InfoHash;
use crate::reactor::ConnectionId;

fn peer_state(piece_count: usize) -> PeerState {
    let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
    PeerState::new(PeerId::generate(), ConnectionId(1), addr, piece_count)
}

fn drained(state: &mut PeerState) -> Vec<Message> {
    let mut buf = BytesMut::new();
    state.drain_outbox(&mut buf);
    let mut messages = Vec::new();
    while let Some(message) = Message::parse(&mut buf).unwrap() {
        messages.push(message);
    }
    messages
}

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1, id2);
    assert_eq!(&id1.as_bytes()[..8], b"-BS0100-");
}

#[test]
fn test_handshake_encode_decode() {
    let info_hash = InfoHash::from([1u8; 20]);
    let peer_id = PeerId::generate();

    let encoded = Handshake::new(info_hash, peer_id).encode();
    assert_eq!(encoded.len(), 68);
    assert_eq!(encoded[0], 19);
    assert_eq!(&encoded[1..20], b"BitTorrent protocol");
    assert_eq!(&encoded[20..28], &[0u8; 8]);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded.info_hash, info_hash);
    assert_eq!(decoded.peer_id, peer_id);
}

#[test]
fn test_handshake_reserved_bits_ignored() {
    let mut raw = BytesMut::from(&Handshake::new(InfoHash::from([3; 20]), PeerId::generate()).encode()[..]);
    raw[25] = 0x10;
    raw[27] = 0x05;

    let parsed = Handshake::parse(&mut raw).unwrap().unwrap();
    assert_eq!(parsed.info_hash, InfoHash::from([3; 20]));
    assert!(raw.is_empty());
}

#[test]
fn test_handshake_waits_for_all_bytes() {
    let encoded = Handshake::new(InfoHash::from([4; 20]), PeerId::generate()).encode();
    let mut buf = BytesMut::from(&encoded[..40]);
    assert!(Handshake::parse(&mut buf).unwrap().is_none());

    buf.extend_from_slice(&encoded[40..]);
    assert!(Handshake::parse(&mut buf).unwrap().is_some());
}

#[test]
fn test_handshake_rejects_foreign_protocol_early() {
    let mut buf = BytesMut::from(&b"\x13BitTorrent protocoX"[..10]);
    assert!(Handshake::parse(&mut buf).unwrap().is_none());

    let mut buf = BytesMut::from(&b"GET /announce HTTP/1.1\r\n"[..]);
    assert!(matches!(
        Handshake::parse(&mut buf),
        Err(PeerError::InvalidHandshake(_))
    ));
}

#[test]
fn test_message_encode_decode() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xF0, 0x80])),
        Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Piece {
            index: 1,
            begin: 0,
            data: Bytes::from_static(b"block"),
        },
        Message::Cancel {
            index: 1,
            begin: 16384,
            length: 16384,
        },
    ];

    let mut buf = BytesMut::new();
    for message in &messages {
        message.encode_into(&mut buf);
    }
    let mut decoded = Vec::new();
    while let Some(message) = Message::parse(&mut buf).unwrap() {
        decoded.push(message);
    }
    assert_eq!(decoded, messages);
}

#[test]
fn test_message_wire_layout() {
    let encoded = Message::Have { piece: 7 }.encode();
    assert_eq!(&encoded[..], &[0, 0, 0, 5, 4, 0, 0, 0, 7]);
    assert_eq!(&Message::KeepAlive.encode()[..], &[0, 0, 0, 0]);
}

#[test]
fn test_message_partial_frame() {
    let encoded = Message::Request {
        index: 0,
        begin: 0,
        length: 16384,
    }
    .encode();

    let mut buf = BytesMut::from(&encoded[..3]);
    assert!(Message::parse(&mut buf).unwrap().is_none());
    buf.extend_from_slice(&encoded[3..10]);
    assert!(Message::parse(&mut buf).unwrap().is_none());
    buf.extend_from_slice(&encoded[10..]);
    assert!(Message::parse(&mut buf).unwrap().is_some());
    assert!(buf.is_empty());
}

#[test]
fn test_message_too_large() {
    let mut buf = BytesMut::new();
    buf.put_u32(17 * 1024 * 1024);
    buf.put_u8(7);
    assert!(matches!(
        Message::parse(&mut buf),
        Err(PeerError::MessageTooLarge(_))
    ));
}

#[rstest]
#[case::choke_with_payload(0, 1)]
#[case::have_short(4, 3)]
#[case::request_long(6, 13)]
#[case::cancel_short(8, 11)]
fn test_fixed_length_violation(#[case] id: u8, #[case] payload: usize) {
    let mut buf = BytesMut::new();
    buf.put_u32(1 + payload as u32);
    buf.put_u8(id);
    buf.put_bytes(0, payload);

    assert!(matches!(
        Message::parse(&mut buf),
        Err(PeerError::InvalidMessage(_))
    ));
}

#[test]
fn test_piece_too_short() {
    let mut buf = BytesMut::new();
    buf.put_u32(5);
    buf.put_u8(7);
    buf.put_u32(1);
    assert!(Message::parse(&mut buf).is_err());
}

#[test]
fn test_unknown_id_is_skipped() {
    let mut buf = BytesMut::new();
    buf.put_u32(3);
    buf.put_u8(20);
    buf.put_u16(0xBEEF);
    Message::Unchoke.encode_into(&mut buf);

    assert_eq!(Message::parse(&mut buf).unwrap(), Some(Message::Unknown(20)));
    assert_eq!(Message::parse(&mut buf).unwrap(), Some(Message::Unchoke));
}

#[test]
fn test_bitfield_payload() {
    let bf = Bitfield::from_payload(&[0b1010_0000], 3).unwrap();
    assert!(bf.has_piece(0));
    assert!(!bf.has_piece(1));
    assert!(bf.has_piece(2));
    assert!(!bf.has_piece(3));
    assert_eq!(bf.pieces().collect::<Vec<_>>(), vec![0, 2]);
    assert_eq!(&bf.to_bytes()[..], &[0b1010_0000]);
}

#[rstest]
#[case::wrong_length(&[0xFF, 0x00], 3)]
#[case::spare_bits(&[0b1111_0000], 3)]
fn test_bitfield_payload_rejected(#[case] payload: &[u8], #[case] pieces: usize) {
    assert!(matches!(
        Bitfield::from_payload(payload, pieces),
        Err(PeerError::Protocol(_))
    ));
}

#[test]
fn test_full_bitfield_clears_spare_bits() {
    let bf = Bitfield::full(10);
    assert_eq!(&bf.to_bytes()[..], &[0xFF, 0b1100_0000]);
    assert!(bf.is_complete());
}

#[test]
fn test_block_arithmetic() {
    assert_eq!(compute_block_count(524288, 16384), 32);
    assert_eq!(compute_block_count(16385, 16384), 2);
    assert_eq!(compute_block_length(16385, 0, 16384), 16384);
    assert_eq!(compute_block_length(16385, 1, 16384), 1);

    let block = Block::new(2, 16384, Bytes::from_static(b"abc"));
    assert_eq!(block.request(), BlockRequest::new(2, 16384, 3));
    assert_eq!(
        BlockRequest::new(2, 0, 16384).to_cancel(),
        Message::Cancel {
            index: 2,
            begin: 0,
            length: 16384
        }
    );
}

#[test]
fn test_second_bitfield_is_a_violation() {
    let mut state = peer_state(8);
    assert!(state.mark_received());
    state.apply_bitfield(&[0xFF], true).unwrap();
    assert!(state.bitfield.is_complete());

    assert!(!state.mark_received());
    assert!(matches!(
        state.apply_bitfield(&[0xFF], false),
        Err(PeerError::Protocol(_))
    ));
}

#[test]
fn test_have_updates_bitfield() {
    let mut state = peer_state(4);
    assert!(state.apply_have(3).unwrap());
    assert!(!state.apply_have(3).unwrap());
    assert!(state.bitfield.has_piece(3));
    assert!(matches!(state.apply_have(4), Err(PeerError::Protocol(_))));
}

#[test]
fn test_state_changes_only_send_on_transition() {
    let mut state = peer_state(4);

    assert!(state.set_interest(true));
    assert!(!state.set_interest(true));
    assert!(state.set_choking(false));
    assert!(!state.set_choking(false));
    assert_eq!(drained(&mut state), vec![Message::Interested, Message::Unchoke]);
    assert!(!state.has_outbox());

    state.queue_upload(BlockRequest::new(0, 0, 16384));
    state.queue_upload(BlockRequest::new(0, 0, 16384));
    assert_eq!(state.upload_queue.len(), 1);

    assert!(state.set_choking(true));
    assert!(state.upload_queue.is_empty());
    assert_eq!(drained(&mut state), vec![Message::Choke]);
}

#[test]
fn test_pipeline_bookkeeping() {
    let mut state = peer_state(4);
    assert!(!state.can_request());
    state.set_interest(true);
    state.choking.peer_choking = false;
    assert!(state.can_request());

    let req = BlockRequest::new(1, 0, 16384);
    state.in_flight.push(req);
    assert_eq!(state.pipeline_room(5), 4);
    assert!(state.complete_request(&req));
    assert!(!state.complete_request(&req));
    assert_eq!(state.pipeline_room(5), 5);
}

#[test]
fn test_keepalive_due() {
    let mut state = peer_state(1);
    let now = Instant::now();
    assert!(!state.keepalive_due(now, Duration::from_secs(60)));
    assert!(state.keepalive_due(now + Duration::from_secs(61), Duration::from_secs(60)));

    state.send(&Message::KeepAlive);
    assert!(!state.keepalive_due(Instant::now(), Duration::from_secs(60)));
}

#[test]
fn test_choking_unchokes_interested_peer_when_slot_free() {
    let mut choker = ChokingAlgorithm::new(2);
    let a = PeerId::generate();
    let b = PeerId::generate();
    let c = PeerId::generate();
    for id in [a, b, c] {
        choker.add_peer(id);
    }

    assert!(choker.set_interested(&a, true));
    assert!(choker.set_interested(&b, true));
    assert!(!choker.set_interested(&c, true));
    assert_eq!(choker.unchoked_count(), 2);
}

#[test]
fn test_choking_rechoke_prefers_best_uploaders() {
    let mut choker = ChokingAlgorithm::new(2);
    let peers: Vec<PeerId> = (0..4).map(|_| PeerId::generate()).collect();
    for id in &peers {
        choker.add_peer(*id);
        choker.set_interested(id, true);
        choker.set_choked(id, true);
    }
    choker.record_download(&peers[3], 1000);
    choker.record_download(&peers[1], 10);

    let decisions = choker.rechoke(false);
    assert!(decisions.contains(&(peers[3], true)));
    assert_eq!(choker.unchoked_count(), 2);

    // Counters reset each round.
    choker.record_download(&peers[2], 5000);
    let decisions = choker.rechoke(false);
    assert!(decisions.contains(&(peers[3], false)));
    assert!(choker.unchoked_count() <= 2);
}

#[test]
fn test_choking_ignores_uninterested_peers() {
    let mut choker = ChokingAlgorithm::new(4);
    let id = PeerId::generate();
    choker.add_peer(id);
    choker.record_download(&id, 1 << 20);

    assert!(choker.rechoke(false).is_empty());
    assert_eq!(choker.unchoked_count(), 0);

    choker.remove_peer(&id);
    assert_eq!(choker.peer_count(), 0);
}
