use super::error::StorageError;
use super::file::{file_spans, FileEntry, FileSpan};
use crate::metainfo::{HashingPool, Metainfo, PendingDigest};
use crate::peer::Bitfield;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace, warn};

/// Download progress of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Absent,
    /// Some blocks written.
    Partial,
    /// Every byte written, digest not yet checked.
    Complete,
    /// Digest matched; the piece may be served.
    Verified,
}

#[derive(Debug)]
struct PieceSlot {
    state: PieceState,
    /// Written blocks: offset within the piece to length.
    blocks: BTreeMap<u32, u32>,
}

impl PieceSlot {
    fn reset(&mut self) {
        self.state = PieceState::Absent;
        self.blocks.clear();
    }
}

/// Random-access storage for one torrent's files, addressed by piece.
///
/// Every piece has its own lock: reads of a piece share it, writes and
/// verification take it exclusively, so writers to different pieces proceed
/// in parallel while writes to the same piece are serialized.
pub struct PieceStore {
    base_path: PathBuf,
    files: Vec<FileEntry>,
    handles: Vec<Mutex<Option<File>>>,
    piece_length: u64,
    total_length: u64,
    hashes: Vec<[u8; 20]>,
    slots: Vec<RwLock<PieceSlot>>,
    verified: AtomicUsize,
}

fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

impl PieceStore {
    /// Storage for `metainfo` rooted at `base_path`. Nothing is touched on
    /// disk until the first read or write.
    pub fn open(base_path: impl Into<PathBuf>, metainfo: &Metainfo) -> Result<Self, StorageError> {
        let files = metainfo
            .info
            .files
            .iter()
            .map(|f| FileEntry::new(f.path.clone(), f.length, f.offset))
            .collect();
        Self::new(
            base_path,
            files,
            metainfo.info.piece_length,
            metainfo.info.pieces.clone(),
        )
    }

    pub fn new(
        base_path: impl Into<PathBuf>,
        files: Vec<FileEntry>,
        piece_length: u64,
        hashes: Vec<[u8; 20]>,
    ) -> Result<Self, StorageError> {
        for file in &files {
            validate_file_path(&file.path)?;
        }
        let total_length = files.iter().map(|f| f.length).sum();
        let handles = files.iter().map(|_| Mutex::new(None)).collect();
        let slots = hashes
            .iter()
            .map(|_| {
                RwLock::new(PieceSlot {
                    state: PieceState::Absent,
                    blocks: BTreeMap::new(),
                })
            })
            .collect();

        Ok(Self {
            base_path: base_path.into(),
            files,
            handles,
            piece_length,
            total_length,
            hashes,
            slots,
            verified: AtomicUsize::new(0),
        })
    }

    pub fn piece_count(&self) -> usize {
        self.hashes.len()
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn piece_size(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length;
        self.total_length
            .saturating_sub(start)
            .min(self.piece_length)
    }

    pub fn state(&self, index: u32) -> PieceState {
        self.slots
            .get(index as usize)
            .map(|slot| slot.read().state)
            .unwrap_or(PieceState::Absent)
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.state(index) == PieceState::Verified
    }

    pub fn verified_count(&self) -> usize {
        self.verified.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count() == self.piece_count()
    }

    /// Verified pieces.
    pub fn bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::new(self.piece_count());
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.read().state == PieceState::Verified {
                bitfield.set_piece(index);
            }
        }
        bitfield
    }

    /// Bytes not yet covered by a verified piece.
    pub fn left(&self) -> u64 {
        (0..self.piece_count() as u32)
            .filter(|&i| !self.has_piece(i))
            .map(|i| self.piece_size(i))
            .sum()
    }

    /// Creates every file at its final length.
    pub fn preallocate(&self) -> Result<(), StorageError> {
        for index in 0..self.files.len() {
            let mut handle = self.handles[index].lock();
            let file = self.open_handle(index, &mut handle)?;
            if file.metadata()?.len() < self.files[index].length {
                file.set_len(self.files[index].length)
                    .map_err(StorageError::from_write)?;
            }
        }
        Ok(())
    }

    pub fn read_block(&self, piece: u32, offset: u32, length: u32) -> Result<Bytes, StorageError> {
        let start = self.block_start(piece, offset, length)?;
        let _guard = self.slot(piece)?.read();

        let mut buf = vec![0u8; length as usize];
        self.read_at(start, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    pub fn read_piece(&self, piece: u32) -> Result<Vec<u8>, StorageError> {
        let _guard = self.slot(piece)?.read();
        self.read_piece_unlocked(piece)
    }

    /// Writes one block and reports the piece's new state. Blocks for a
    /// verified piece are ignored.
    pub fn write_block(
        &self,
        piece: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<PieceState, StorageError> {
        let length = u32::try_from(data.len()).map_err(|_| StorageError::InvalidBlock {
            piece,
            offset,
            length: u32::MAX,
        })?;
        let start = self.block_start(piece, offset, length)?;
        let mut slot = self.slot(piece)?.write();

        if slot.state == PieceState::Verified {
            trace!(piece, offset, "ignoring block for verified piece");
            return Ok(PieceState::Verified);
        }

        self.write_at(start, data)?;
        slot.blocks.insert(offset, length);

        let covered = covered_bytes(&slot.blocks);
        slot.state = if covered >= self.piece_size(piece) {
            PieceState::Complete
        } else {
            PieceState::Partial
        };
        Ok(slot.state)
    }

    /// Hashes the piece from disk. A match marks it verified; a mismatch
    /// forgets its blocks and returns it to [`PieceState::Absent`].
    pub fn verify_piece(&self, piece: u32) -> Result<bool, StorageError> {
        let mut slot = self.slot(piece)?.write();
        if slot.state == PieceState::Verified {
            return Ok(true);
        }

        let data = self.read_piece_unlocked(piece)?;
        let digest: [u8; 20] = Sha1::digest(&data).into();
        Ok(self.apply_digest(piece, &mut slot, digest))
    }

    /// Checks data already on disk, typically before seeding, and returns the
    /// number of verified pieces. Pieces whose files are missing or short
    /// stay absent. Digests run on `pool`, at most `pool.threads()` at a time.
    pub fn recheck(&self, pool: &HashingPool) -> Result<usize, StorageError> {
        let mut pending: VecDeque<(u32, PendingDigest)> = VecDeque::new();

        for piece in 0..self.piece_count() as u32 {
            if self.has_piece(piece) {
                continue;
            }
            if let Some(data) = self.read_existing(piece)? {
                pending.push_back((piece, pool.submit(data)?));
            }
            if pending.len() >= pool.threads() {
                self.settle(&mut pending, pool)?;
            }
        }
        self.settle(&mut pending, pool)?;

        let verified = self.verified_count();
        debug!(
            verified,
            pieces = self.piece_count(),
            path = %self.base_path.display(),
            "recheck finished"
        );
        Ok(verified)
    }

    fn settle(
        &self,
        pending: &mut VecDeque<(u32, PendingDigest)>,
        pool: &HashingPool,
    ) -> Result<(), StorageError> {
        while let Some((piece, digest)) = pending.pop_front() {
            let digest = digest.wait(pool.task_timeout())?;
            let mut slot = self.slot(piece)?.write();
            self.apply_digest(piece, &mut slot, digest);
        }
        Ok(())
    }

    fn apply_digest(&self, piece: u32, slot: &mut PieceSlot, digest: [u8; 20]) -> bool {
        if slot.state == PieceState::Verified {
            return true;
        }
        if self.hashes[piece as usize] == digest {
            slot.state = PieceState::Verified;
            slot.blocks.clear();
            self.verified.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            slot.reset();
            false
        }
    }

    /// Reads a piece for rechecking; `None` when the files do not hold it yet.
    fn read_existing(&self, piece: u32) -> Result<Option<Vec<u8>>, StorageError> {
        let start = piece as u64 * self.piece_length;
        for span in file_spans(&self.files, start..start + self.piece_size(piece)) {
            let path = self.base_path.join(&self.files[span.file_index].path);
            match std::fs::metadata(&path) {
                Ok(meta) if meta.len() >= span.file_offset + span.length => {}
                Ok(_) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        self.read_piece(piece).map(Some)
    }

    fn read_piece_unlocked(&self, piece: u32) -> Result<Vec<u8>, StorageError> {
        let mut buf = vec![0u8; self.piece_size(piece) as usize];
        self.read_at(piece as u64 * self.piece_length, &mut buf)?;
        Ok(buf)
    }

    fn slot(&self, piece: u32) -> Result<&RwLock<PieceSlot>, StorageError> {
        self.slots
            .get(piece as usize)
            .ok_or(StorageError::InvalidPieceIndex(piece))
    }

    fn block_start(&self, piece: u32, offset: u32, length: u32) -> Result<u64, StorageError> {
        if piece as usize >= self.piece_count() {
            return Err(StorageError::InvalidPieceIndex(piece));
        }
        if length == 0 || offset as u64 + length as u64 > self.piece_size(piece) {
            return Err(StorageError::InvalidBlock {
                piece,
                offset,
                length,
            });
        }
        Ok(piece as u64 * self.piece_length + offset as u64)
    }

    fn read_at(&self, start: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let mut filled = 0usize;
        for span in file_spans(&self.files, start..start + buf.len() as u64) {
            let end = filled + span.length as usize;
            self.with_file(&span, |file| file.read_exact(&mut buf[filled..end]))?;
            filled = end;
        }
        Ok(())
    }

    fn write_at(&self, start: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut written = 0usize;
        for span in file_spans(&self.files, start..start + data.len() as u64) {
            let end = written + span.length as usize;
            self.with_file(&span, |file| file.write_all(&data[written..end]))
                .map_err(|e| match e {
                    StorageError::Io(e) => StorageError::from_write(e),
                    other => other,
                })?;
            written = end;
        }
        Ok(())
    }

    fn with_file<T>(
        &self,
        span: &FileSpan,
        op: impl FnOnce(&mut File) -> io::Result<T>,
    ) -> Result<T, StorageError> {
        let mut handle = self.handles[span.file_index].lock();
        let file = self.open_handle(span.file_index, &mut handle)?;
        file.seek(SeekFrom::Start(span.file_offset))?;
        Ok(op(file)?)
    }

    fn open_handle<'a>(
        &self,
        index: usize,
        handle: &'a mut Option<File>,
    ) -> Result<&'a mut File, StorageError> {
        if handle.is_none() {
            let path = self.base_path.join(&self.files[index].path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
            {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    warn!(path = %path.display(), "opening read-only");
                    File::open(&path)?
                }
                Err(e) => return Err(e.into()),
            };
            *handle = Some(file);
        }
        handle
            .as_mut()
            .ok_or_else(|| StorageError::Io(io::Error::other("file handle unavailable")))
    }
}

impl std::fmt::Debug for PieceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStore")
            .field("base_path", &self.base_path)
            .field("files", &self.files.len())
            .field("pieces", &self.piece_count())
            .field("verified", &self.verified_count())
            .finish()
    }
}

/// Bytes covered by possibly overlapping `(offset, length)` blocks.
fn covered_bytes(blocks: &BTreeMap<u32, u32>) -> u64 {
    let mut covered = 0u64;
    let mut reach = 0u64;
    for (&offset, &length) in blocks {
        let (start, end) = (offset as u64, offset as u64 + length as u64);
        if end > reach {
            covered += end - start.max(reach);
            reach = end;
        }
    }
    covered
}
