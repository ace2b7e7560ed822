//! Torrent descriptor builder.
//!
//! [`TorrentBuilder`] turns files on disk into a bencoded descriptor. With no
//! explicit file list it describes `parent` as a single file; otherwise each
//! listed file becomes an entry of a multi-file torrent named after `parent`,
//! with a `path` relative to it.
//!
//! # Examples
//!
//! ```no_run
//! use bitswarm::metainfo::TorrentBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let torrent = TorrentBuilder::new("dist/release")
//!     .add_directory()?
//!     .announce("http://tracker.example.com:6969/announce")
//!     .piece_length(256 * 1024)
//!     .build()?;
//!
//! std::fs::write("release.torrent", torrent)?;
//! # Ok(())
//! # }
//! ```

use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::debug;

use super::error::MetainfoError;
use super::hasher::HashingPool;
use super::torrent::{expected_piece_count, tiers_value, Metainfo};
use crate::bencode::{encode, Value};
use crate::config::HashingConfig;
use crate::constants::{CREATED_BY, DEFAULT_PIECE_LENGTH};

/// Builder for torrent descriptors.
#[derive(Debug, Clone)]
pub struct TorrentBuilder {
    parent: PathBuf,
    files: Vec<PathBuf>,
    piece_length: u64,
    announce: Option<String>,
    announce_list: Vec<Vec<String>>,
    comment: Option<String>,
    created_by: String,
    creation_date: Option<i64>,
    private: bool,
    hashing: HashingConfig,
}

impl TorrentBuilder {
    /// Starts a descriptor rooted at `parent`: the shared file in single-file
    /// mode, the directory holding every listed file in multi-file mode.
    pub fn new(parent: impl Into<PathBuf>) -> Self {
        Self {
            parent: parent.into(),
            files: Vec::new(),
            piece_length: DEFAULT_PIECE_LENGTH,
            announce: None,
            announce_list: Vec::new(),
            comment: None,
            created_by: CREATED_BY.to_string(),
            creation_date: None,
            private: false,
            hashing: HashingConfig::from_env(),
        }
    }

    /// Adds a file under `parent`; its position in the stream follows call order.
    pub fn add_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files.extend(files.into_iter().map(Into::into));
        self
    }

    /// Adds every regular file below `parent`, sorted by path.
    pub fn add_directory(self) -> Result<Self, MetainfoError> {
        let files = list_files(&self.parent)?;
        Ok(self.files(files))
    }

    pub fn piece_length(mut self, length: u64) -> Self {
        self.piece_length = length;
        self
    }

    /// Sets the primary tracker URL.
    pub fn announce(mut self, url: impl Into<String>) -> Self {
        self.announce = Some(url.into());
        self
    }

    /// Appends a tracker tier to `announce-list`.
    pub fn add_tracker_tier<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tier: Vec<String> = urls.into_iter().map(Into::into).collect();
        if !tier.is_empty() {
            self.announce_list.push(tier);
        }
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }

    /// Seconds since the Unix epoch; defaults to the time of [`build`](Self::build).
    pub fn creation_date(mut self, timestamp: i64) -> Self {
        self.creation_date = Some(timestamp);
        self
    }

    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    /// Replaces the hashing settings, which default to [`HashingConfig::from_env`].
    pub fn hashing(mut self, config: HashingConfig) -> Self {
        self.hashing = config;
        self
    }

    /// Hashes the content on a private pool and returns the encoded descriptor.
    pub fn build(self) -> Result<Vec<u8>, MetainfoError> {
        let pool = HashingPool::new(&self.hashing)?;
        self.build_with(&pool)
    }

    /// Same as [`build`](Self::build), on a caller-owned pool.
    pub fn build_with(self, pool: &HashingPool) -> Result<Vec<u8>, MetainfoError> {
        self.validate()?;
        let info = self.info(pool)?;

        let mut root = vec![
            ("info", info),
            ("created by", Value::string(&self.created_by)),
            (
                "creation date",
                Value::Integer(self.creation_date.unwrap_or_else(now)),
            ),
        ];
        if let Some(announce) = &self.announce {
            root.push(("announce", Value::string(announce)));
        }
        if !self.announce_list.is_empty() {
            root.push(("announce-list", tiers_value(&self.announce_list)));
        }
        if let Some(comment) = &self.comment {
            root.push(("comment", Value::string(comment)));
        }

        Ok(encode(&Value::dict(root)))
    }

    /// Builds and parses the result back into a [`Metainfo`].
    pub fn build_metainfo(self) -> Result<Metainfo, MetainfoError> {
        Metainfo::from_bytes(&self.build()?)
    }

    fn validate(&self) -> Result<(), MetainfoError> {
        if self.piece_length == 0 {
            return Err(MetainfoError::InvalidField("piece length"));
        }
        if self.announce.is_none() && self.announce_list.is_empty() {
            return Err(MetainfoError::MissingField("announce"));
        }
        Ok(())
    }

    fn info(&self, pool: &HashingPool) -> Result<Value, MetainfoError> {
        let name = self
            .parent
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(MetainfoError::InvalidField("name"))?;

        let mut info = vec![
            ("name", Value::string(name)),
            ("piece length", Value::Integer(self.piece_length as i64)),
        ];
        if self.private {
            info.push(("private", Value::Integer(1)));
        }

        let total_length = if self.files.is_empty() {
            let length = std::fs::metadata(&self.parent)?.len();
            debug!(file = %self.parent.display(), length, "creating single-file torrent");
            info.push(("length", Value::Integer(length as i64)));
            info.push(("pieces", self.pieces(pool, &[&self.parent])?));
            length
        } else {
            let mut entries = Vec::with_capacity(self.files.len());
            let mut total = 0;
            for file in &self.files {
                let length = std::fs::metadata(file)?.len();
                total += length;
                entries.push(Value::dict([
                    ("length", Value::Integer(length as i64)),
                    ("path", relative_components(&self.parent, file)?),
                ]));
            }
            debug!(
                dir = %self.parent.display(),
                files = self.files.len(),
                total,
                "creating multi-file torrent"
            );
            info.push(("files", Value::List(entries)));
            info.push(("pieces", self.pieces(pool, &self.files)?));
            total
        };

        debug!(
            pieces = expected_piece_count(total_length, self.piece_length),
            piece_length = self.piece_length,
            "hashed torrent content"
        );
        Ok(Value::dict(info))
    }

    fn pieces<P: AsRef<Path>>(
        &self,
        pool: &HashingPool,
        files: &[P],
    ) -> Result<Value, MetainfoError> {
        let digests = pool.hash_files(files, self.piece_length)?;
        Ok(Value::Bytes(Bytes::from(digests)))
    }
}

/// Components of `file` below `parent`, as a bencode list of strings.
fn relative_components(parent: &Path, file: &Path) -> Result<Value, MetainfoError> {
    let outside = || MetainfoError::OutsideParent(file.display().to_string());
    let relative = file.strip_prefix(parent).map_err(|_| outside())?;

    let components = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str().map(Value::string).ok_or_else(outside),
            _ => Err(outside()),
        })
        .collect::<Result<Vec<_>, _>>()?;

    if components.is_empty() {
        return Err(outside());
    }
    Ok(Value::List(components))
}

/// Every regular file below `dir`, sorted by path.
pub fn list_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, MetainfoError> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, out)?;
            } else if path.is_file() {
                out.push(path);
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(dir.as_ref(), &mut files)?;
    files.sort();
    Ok(files)
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
