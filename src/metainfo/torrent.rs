use super::error::MetainfoError;
use super::info_hash::InfoHash;
use crate::bencode::{decode, encode, Value};
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// A parsed torrent descriptor.
///
/// # Examples
///
/// ```no_run
/// use bitswarm::metainfo::Metainfo;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let metainfo = Metainfo::from_file("example.torrent")?;
///
/// println!("Torrent: {}", metainfo.info.name);
/// println!("Size: {} bytes in {} pieces", metainfo.info.total_length, metainfo.info.piece_count());
/// println!("Info hash: {}", metainfo.info_hash);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info: Info,
    pub info_hash: InfoHash,
    /// Primary tracker URL.
    pub announce: Option<String>,
    /// Tracker tiers ([BEP-12](http://bittorrent.org/beps/bep_0012.html)).
    pub announce_list: Vec<Vec<String>>,
    /// Seconds since the Unix epoch.
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    info_value: Value,
}

/// The info dictionary: everything covered by the info-hash.
#[derive(Debug, Clone)]
pub struct Info {
    /// File name in single-file mode, root directory name otherwise.
    pub name: String,
    pub piece_length: u64,
    pub pieces: Vec<[u8; 20]>,
    /// Files in stream order. Paths are relative to the download directory
    /// and start with `name` in multi-file mode.
    pub files: Vec<File>,
    pub total_length: u64,
    pub private: bool,
    pub multi_file: bool,
}

/// A file within a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset of the file within the concatenated stream.
    pub offset: u64,
}

impl Metainfo {
    /// Parses and validates a bencoded descriptor.
    ///
    /// # Errors
    ///
    /// Fails on malformed bencode, missing or mistyped fields, a zero piece
    /// length, a `pieces` string that is not exactly 20 bytes per piece, or a
    /// file path component that could escape the download directory.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let root = decode(data)?;
        Self::from_value(root)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MetainfoError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub(crate) fn from_value(root: Value) -> Result<Self, MetainfoError> {
        let mut dict = root.into_dict().ok_or(MetainfoError::InvalidField("root"))?;

        let info_value = dict
            .remove(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;
        let info = parse_info(&info_value)?;
        let info_hash = InfoHash::from_info_bytes(&encode(&info_value));

        let text = |key: &str| {
            dict.get(key.as_bytes())
                .and_then(Value::as_str)
                .map(String::from)
        };

        let announce_list = dict
            .get(b"announce-list".as_slice())
            .and_then(Value::as_list)
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(Value::as_list)
                    .map(|urls| {
                        urls.iter()
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect::<Vec<_>>()
                    })
                    .filter(|tier| !tier.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            info,
            info_hash,
            announce: text("announce"),
            announce_list,
            creation_date: dict
                .get(b"creation date".as_slice())
                .and_then(Value::as_integer),
            comment: text("comment"),
            created_by: text("created by"),
            info_value,
        })
    }

    /// Re-encodes the descriptor. The info dictionary is carried over
    /// untouched, so the info-hash is preserved.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut root = vec![("info", self.info_value.clone())];
        if let Some(announce) = &self.announce {
            root.push(("announce", Value::string(announce)));
        }
        if !self.announce_list.is_empty() {
            root.push(("announce-list", tiers_value(&self.announce_list)));
        }
        if let Some(date) = self.creation_date {
            root.push(("creation date", Value::Integer(date)));
        }
        if let Some(comment) = &self.comment {
            root.push(("comment", Value::string(comment)));
        }
        if let Some(created_by) = &self.created_by {
            root.push(("created by", Value::string(created_by)));
        }
        encode(&Value::dict(root))
    }

    /// The canonically encoded info dictionary.
    pub fn raw_info(&self) -> Bytes {
        Bytes::from(encode(&self.info_value))
    }

    /// All tracker URLs: `announce` first, then each tier in order, without duplicates.
    pub fn trackers(&self) -> Vec<String> {
        let mut trackers: Vec<String> = self.announce.iter().cloned().collect();

        for url in self.announce_list.iter().flatten() {
            if !trackers.contains(url) {
                trackers.push(url.clone());
            }
        }

        trackers
    }
}

impl Info {
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Length of piece `index`; only the last piece may be short.
    pub fn piece_size(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length;
        self.total_length
            .saturating_sub(start)
            .min(self.piece_length)
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.pieces.get(index as usize)
    }
}

/// `⌈total_length / piece_length⌉`
pub fn expected_piece_count(total_length: u64, piece_length: u64) -> usize {
    total_length.div_ceil(piece_length) as usize
}

pub(crate) fn tiers_value(tiers: &[Vec<String>]) -> Value {
    Value::List(
        tiers
            .iter()
            .map(|tier| Value::List(tier.iter().map(|u| Value::string(u)).collect()))
            .collect(),
    )
}

fn parse_info(value: &Value) -> Result<Info, MetainfoError> {
    if value.as_dict().is_none() {
        return Err(MetainfoError::InvalidField("info"));
    }

    let name = value
        .get_str("name")
        .ok_or(MetainfoError::MissingField("name"))?
        .to_string();
    check_component(&name)?;

    let piece_length = value
        .get_int("piece length")
        .ok_or(MetainfoError::MissingField("piece length"))?;
    let piece_length = u64::try_from(piece_length)
        .ok()
        .filter(|&n| n > 0)
        .ok_or(MetainfoError::InvalidField("piece length"))?;

    let pieces_bytes = value
        .get_bytes("pieces")
        .ok_or(MetainfoError::MissingField("pieces"))?;
    if pieces_bytes.len() % 20 != 0 {
        return Err(MetainfoError::InvalidField("pieces"));
    }
    let pieces: Vec<[u8; 20]> = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut arr = [0u8; 20];
            arr.copy_from_slice(chunk);
            arr
        })
        .collect();

    let private = value.get_int("private") == Some(1);

    let (files, multi_file) = if let Some(length) = value.get_int("length") {
        let length = u64::try_from(length).map_err(|_| MetainfoError::InvalidField("length"))?;
        let file = File {
            path: PathBuf::from(&name),
            length,
            offset: 0,
        };
        (vec![file], false)
    } else if let Some(list) = value.get("files").and_then(Value::as_list) {
        (parse_files(&name, list)?, true)
    } else {
        return Err(MetainfoError::MissingField("length or files"));
    };

    let total_length = files.iter().map(|f| f.length).sum();
    if pieces.len() != expected_piece_count(total_length, piece_length) {
        return Err(MetainfoError::InvalidField("pieces"));
    }

    Ok(Info {
        name,
        piece_length,
        pieces,
        files,
        total_length,
        private,
        multi_file,
    })
}

fn parse_files(name: &str, list: &[Value]) -> Result<Vec<File>, MetainfoError> {
    let mut files = Vec::with_capacity(list.len());
    let mut offset = 0u64;

    for entry in list {
        let length = entry
            .get_int("length")
            .ok_or(MetainfoError::MissingField("file length"))?;
        let length =
            u64::try_from(length).map_err(|_| MetainfoError::InvalidField("file length"))?;

        let components = entry
            .get("path")
            .and_then(Value::as_list)
            .filter(|p| !p.is_empty())
            .ok_or(MetainfoError::MissingField("file path"))?;

        let mut path = PathBuf::from(name);
        for component in components {
            let component = component
                .as_str()
                .ok_or(MetainfoError::InvalidField("file path"))?;
            check_component(component)?;
            path.push(component);
        }

        files.push(File {
            path,
            length,
            offset,
        });
        offset += length;
    }

    Ok(files)
}

/// Rejects path components that would leave the download directory.
fn check_component(component: &str) -> Result<(), MetainfoError> {
    let invalid = component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(['/', '\\'])
        || component.contains('\0');
    if invalid {
        return Err(MetainfoError::InvalidField("path component"));
    }
    Ok(())
}
