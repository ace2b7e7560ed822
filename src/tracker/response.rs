use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes};

use super::error::TrackerError;
use crate::bencode::{decode, Value};
use crate::metainfo::InfoHash;
use crate::peer::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerEvent {
    #[default]
    None,
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }

    /// Parses the `event` query value; empty and unknown values mean a
    /// regular announce.
    pub fn parse(value: &str) -> Self {
        match value {
            "started" => TrackerEvent::Started,
            "stopped" => TrackerEvent::Stopped,
            "completed" => TrackerEvent::Completed,
            _ => TrackerEvent::None,
        }
    }
}

/// Parameters of one announce.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
    pub numwant: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub min_interval: Option<u32>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub peers: Vec<SocketAddr>,
    pub warning_message: Option<String>,
}

impl AnnounceResponse {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            min_interval: None,
            complete: None,
            incomplete: None,
            peers: Vec::new(),
            warning_message: None,
        }
    }

    /// Parses a bencoded announce reply. A `failure reason` becomes
    /// [`TrackerError::Failure`].
    pub fn from_bencode(body: &[u8]) -> Result<Self, TrackerError> {
        let value = decode(body)?;
        if value.as_dict().is_none() {
            return Err(TrackerError::InvalidResponse("expected dict".into()));
        }
        if let Some(failure) = value.get_str("failure reason") {
            return Err(TrackerError::Failure(failure.to_string()));
        }

        let interval = value
            .get_int("interval")
            .ok_or_else(|| TrackerError::InvalidResponse("missing interval".into()))?;
        let mut response = AnnounceResponse::new(clamp_u32(interval));
        response.min_interval = value.get_int("min interval").map(clamp_u32);
        response.complete = value.get_int("complete").map(clamp_u32);
        response.incomplete = value.get_int("incomplete").map(clamp_u32);
        response.warning_message = value.get_str("warning message").map(String::from);

        match value.get("peers") {
            Some(Value::Bytes(compact)) => response.peers = parse_compact_peers(compact),
            Some(Value::List(list)) => {
                response.peers = list
                    .iter()
                    .filter_map(|peer| {
                        let ip: IpAddr = peer.get_str("ip")?.parse().ok()?;
                        let port = u16::try_from(peer.get_int("port")?).ok()?;
                        Some(SocketAddr::new(ip, port))
                    })
                    .collect();
            }
            _ => {}
        }
        if let Some(compact6) = value.get_bytes("peers6") {
            response.peers.extend(parse_compact_peers6(compact6));
        }

        Ok(response)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeResponse {
    pub files: Vec<ScrapeFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeFile {
    pub info_hash: InfoHash,
    pub complete: u32,
    pub incomplete: u32,
    pub downloaded: u32,
}

impl ScrapeResponse {
    pub fn from_bencode(body: &[u8]) -> Result<Self, TrackerError> {
        let value = decode(body)?;
        if let Some(failure) = value.get_str("failure reason") {
            return Err(TrackerError::Failure(failure.to_string()));
        }
        let files = value
            .get("files")
            .and_then(Value::as_dict)
            .ok_or_else(|| TrackerError::InvalidResponse("missing files".into()))?;

        let files = files
            .iter()
            .filter_map(|(key, stats)| {
                Some(ScrapeFile {
                    info_hash: InfoHash::from_bytes(key).ok()?,
                    complete: stats.get_int("complete").map_or(0, clamp_u32),
                    incomplete: stats.get_int("incomplete").map_or(0, clamp_u32),
                    downloaded: stats.get_int("downloaded").map_or(0, clamp_u32),
                })
            })
            .collect();
        Ok(Self { files })
    }

    pub fn to_bencode(&self) -> Vec<u8> {
        let files: BTreeMap<Bytes, Value> = self
            .files
            .iter()
            .map(|file| {
                let stats = Value::dict([
                    ("complete", Value::from(file.complete as i64)),
                    ("downloaded", Value::from(file.downloaded as i64)),
                    ("incomplete", Value::from(file.incomplete as i64)),
                ]);
                (Bytes::copy_from_slice(file.info_hash.as_bytes()), stats)
            })
            .collect();
        crate::bencode::encode(&Value::dict([("files", Value::Dict(files))]))
    }
}

fn clamp_u32(value: i64) -> u32 {
    value.clamp(0, u32::MAX as i64) as u32
}

#[derive(Debug, Clone, Copy)]
pub struct CompactPeer {
    pub ip: IpAddr,
    pub port: u16,
}

impl CompactPeer {
    pub fn from_v4_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 6 {
            return None;
        }
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        Some(Self {
            ip: IpAddr::V4(ip),
            port,
        })
    }

    pub fn from_v6_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 18 {
            return None;
        }
        let mut ip_bytes = [0u8; 16];
        ip_bytes.copy_from_slice(&bytes[..16]);
        let ip = Ipv6Addr::from(ip_bytes);
        let port = u16::from_be_bytes([bytes[16], bytes[17]]);
        Some(Self {
            ip: IpAddr::V6(ip),
            port,
        })
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Appends the 6-byte (IPv4) or 18-byte (IPv6) form.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self.ip {
            IpAddr::V4(ip) => buf.put_slice(&ip.octets()),
            IpAddr::V6(ip) => buf.put_slice(&ip.octets()),
        }
        buf.put_u16(self.port);
    }
}

impl From<SocketAddr> for CompactPeer {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .filter_map(CompactPeer::from_v4_bytes)
        .map(|p| p.to_socket_addr())
        .collect()
}

pub fn parse_compact_peers6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .filter_map(CompactPeer::from_v6_bytes)
        .map(|p| p.to_socket_addr())
        .collect()
}
