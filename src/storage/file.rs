use std::ops::Range;
use std::path::PathBuf;

/// A file in the torrent's logical byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the download directory.
    pub path: PathBuf,
    pub length: u64,
    /// Position of the file's first byte in the stream.
    pub offset: u64,
}

/// The part of a stream range that falls inside one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

impl FileEntry {
    pub fn new(path: PathBuf, length: u64, offset: u64) -> Self {
        Self {
            path,
            length,
            offset,
        }
    }

    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// Splits `range` of the stream into per-file spans, in file order.
/// Zero-length files never produce a span.
pub fn file_spans(files: &[FileEntry], range: Range<u64>) -> Vec<FileSpan> {
    let mut spans = Vec::new();
    let mut cursor = range.start;

    for (file_index, file) in files.iter().enumerate() {
        if cursor >= range.end {
            break;
        }
        let file_range = file.byte_range();
        if cursor < file_range.start || cursor >= file_range.end {
            continue;
        }

        let length = range.end.min(file_range.end) - cursor;
        spans.push(FileSpan {
            file_index,
            file_offset: cursor - file.offset,
            length,
        });
        cursor += length;
    }

    spans
}
