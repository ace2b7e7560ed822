use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode, Uri};
use percent_encoding::percent_decode_str;
use tracing::{debug, trace};

use super::error::ServerError;
use super::swarm::{Announce, SwarmRegistry, SwarmView};
use crate::bencode::{encode, Value};
use crate::config::TrackerConfig;
use crate::metainfo::InfoHash;
use crate::peer::PeerId;
use crate::tracker::{CompactPeer, TrackerEvent};

/// A decoded `/announce` query.
#[derive(Debug, Clone)]
pub(crate) struct AnnounceQuery {
    pub announce: Announce,
    pub compact: bool,
    pub numwant: Option<usize>,
}

/// Splits a raw query string into percent-decoded pairs. Values stay bytes
/// since `info_hash` and `peer_id` are binary.
pub(crate) fn query_pairs(query: &str) -> Vec<(String, Vec<u8>)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (
                percent_decode_str(key).decode_utf8_lossy().into_owned(),
                percent_decode_str(value).collect(),
            )
        })
        .collect()
}

fn param<'a>(pairs: &'a [(String, Vec<u8>)], key: &str) -> Option<&'a [u8]> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_slice())
}

fn number<T: std::str::FromStr>(
    pairs: &[(String, Vec<u8>)],
    key: &'static str,
) -> Result<Option<T>, ServerError> {
    param(pairs, key)
        .map(|raw| {
            std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or(ServerError::InvalidParam(key))
        })
        .transpose()
}

fn required<T: std::str::FromStr>(
    pairs: &[(String, Vec<u8>)],
    key: &'static str,
) -> Result<T, ServerError> {
    number(pairs, key)?.ok_or(ServerError::MissingParam(key))
}

fn info_hash(raw: &[u8]) -> Result<InfoHash, ServerError> {
    InfoHash::from_bytes(raw).map_err(|_| ServerError::InvalidParam("info_hash"))
}

/// Parses an announce. The peer's address is the `ip` parameter when it holds
/// a literal address, the socket's remote address otherwise.
pub(crate) fn parse_announce(query: &str, remote: SocketAddr) -> Result<AnnounceQuery, ServerError> {
    let pairs = query_pairs(query);

    let info_hash = info_hash(param(&pairs, "info_hash").ok_or(ServerError::MissingParam("info_hash"))?)?;
    let peer_id = param(&pairs, "peer_id")
        .ok_or(ServerError::MissingParam("peer_id"))
        .and_then(|raw| PeerId::from_bytes(raw).ok_or(ServerError::InvalidParam("peer_id")))?;
    let port: u16 = required(&pairs, "port")?;
    let ip = param(&pairs, "ip")
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|s| s.parse::<IpAddr>().ok())
        .unwrap_or(remote.ip());
    let event = param(&pairs, "event")
        .map(|raw| TrackerEvent::parse(&String::from_utf8_lossy(raw)))
        .unwrap_or_default();
    let compact = number::<u8>(&pairs, "compact")?.is_none_or(|c| c != 0);

    Ok(AnnounceQuery {
        announce: Announce {
            info_hash,
            peer_id,
            addr: SocketAddr::new(ip, port),
            uploaded: number(&pairs, "uploaded")?.unwrap_or(0),
            downloaded: number(&pairs, "downloaded")?.unwrap_or(0),
            left: required(&pairs, "left")?,
            event,
        },
        compact,
        numwant: number(&pairs, "numwant")?,
    })
}

/// Every `info_hash` in a scrape query.
pub(crate) fn parse_scrape(query: &str) -> Result<Vec<InfoHash>, ServerError> {
    query_pairs(query)
        .iter()
        .filter(|(k, _)| k == "info_hash")
        .map(|(_, v)| info_hash(v))
        .collect()
}

pub(crate) fn announce_body(view: &SwarmView, config: &TrackerConfig, compact: bool) -> Vec<u8> {
    let mut entries = vec![
        ("interval", Value::from(config.announce_interval.as_secs() as i64)),
        ("min interval", Value::from(config.min_interval.as_secs() as i64)),
        ("complete", Value::from(i64::from(view.complete))),
        ("incomplete", Value::from(i64::from(view.incomplete))),
    ];

    if compact {
        let mut peers = Vec::new();
        let mut peers6 = Vec::new();
        for peer in &view.peers {
            let buf = if peer.addr.is_ipv4() { &mut peers } else { &mut peers6 };
            CompactPeer::from(peer.addr).write_to(buf);
        }
        entries.push(("peers", Value::from(peers)));
        if !peers6.is_empty() {
            entries.push(("peers6", Value::from(peers6)));
        }
    } else {
        let peers: Vec<Value> = view
            .peers
            .iter()
            .map(|peer| {
                Value::dict([
                    ("ip", Value::from(peer.addr.ip().to_string())),
                    ("peer id", Value::from(&peer.peer_id.as_bytes()[..])),
                    ("port", Value::from(i64::from(peer.addr.port()))),
                ])
            })
            .collect();
        entries.push(("peers", Value::from(peers)));
    }

    encode(&Value::dict(entries))
}

pub(crate) fn failure_body(reason: &str) -> Vec<u8> {
    encode(&Value::dict([("failure reason", Value::string(reason))]))
}

fn reply(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}

/// Answers one tracker request. Bad queries are reported in-band as a
/// bencoded `failure reason`, which clients read regardless of status.
pub(crate) fn handle(
    uri: &Uri,
    remote: SocketAddr,
    registry: &SwarmRegistry,
    config: &TrackerConfig,
) -> Response<Full<Bytes>> {
    let query = uri.query().unwrap_or("");
    trace!(%remote, path = uri.path(), "tracker request");

    match uri.path() {
        "/announce" => match parse_announce(query, remote) {
            Ok(request) => {
                let max = request
                    .numwant
                    .unwrap_or(config.max_peers_per_reply)
                    .min(config.max_peers_per_reply);
                let view = registry.announce(&request.announce, max, Instant::now());
                trace!(
                    info_hash = %request.announce.info_hash,
                    event = request.announce.event.as_str(),
                    peers = view.peers.len(),
                    "announce"
                );
                reply(StatusCode::OK, announce_body(&view, config, request.compact))
            }
            Err(e) => {
                debug!(%remote, error = %e, "rejected announce");
                reply(StatusCode::OK, failure_body(&e.to_string()))
            }
        },
        "/scrape" => match parse_scrape(query) {
            Ok(info_hashes) => {
                let scrape = registry.scrape(&info_hashes, Instant::now());
                reply(StatusCode::OK, scrape.to_bencode())
            }
            Err(e) => {
                debug!(%remote, error = %e, "rejected scrape");
                reply(StatusCode::OK, failure_body(&e.to_string()))
            }
        },
        _ => reply(StatusCode::NOT_FOUND, Vec::new()),
    }
}
