//! A single append-only WAL file: framing, naming, and the writer side.
//!
//! Each frame on disk is `[len:u32 LE][crc32(payload):u32 LE][payload]`. The
//! length and checksum together let a reader tell a clean end-of-segment
//! (zero bytes where the next length prefix would start) apart from a torn
//! tail (a partial length prefix, or a length prefix with fewer payload
//! bytes than it claims) apart from real corruption (a complete frame whose
//! checksum doesn't match). Only the newest segment is allowed a torn tail;
//! see `wal::manager` for how that distinction gets made.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;

use crate::error::Result;

/// Bytes of framing overhead before the payload (4-byte length + 4-byte crc).
pub const FRAME_PREFIX_LEN: usize = 8;

/// Segment file naming: `wal-{ordinal:020}.log`, zero-padded so a plain
/// directory listing sorts in ordinal order.
pub fn segment_file_name(ordinal: u64) -> String {
    format!("wal-{ordinal:020}.log")
}

pub fn segment_path(dir: &Path, ordinal: u64) -> PathBuf {
    dir.join(segment_file_name(ordinal))
}

/// Parses a segment ordinal out of a file name produced by `segment_file_name`.
/// Returns `None` for anything else found in the data directory.
pub fn parse_segment_ordinal(file_name: &str) -> Option<u64> {
    let digits = file_name.strip_prefix("wal-")?.strip_suffix(".log")?;
    digits.parse().ok()
}

/// Encodes one frame: length prefix, crc32 of the payload, then the payload.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// The write side of an active segment: a buffered append-only file handle.
pub struct SegmentWriter {
    ordinal: u64,
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
}

impl SegmentWriter {
    /// Creates a brand new segment file. Fails if one already exists at that
    /// ordinal, since that would silently discard whatever it contains.
    pub fn create(dir: &Path, ordinal: u64, buffer_size: usize) -> Result<Self> {
        let path = segment_path(dir, ordinal);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            ordinal,
            path,
            file: BufWriter::with_capacity(buffer_size.max(1), file),
            size: 0,
        })
    }

    /// Reopens an existing segment for appending, positioned at `size` bytes
    /// (the manager passes the offset of the last verified-good frame when
    /// resuming after a torn-tail truncation).
    pub fn resume(dir: &Path, ordinal: u64, size: u64, buffer_size: usize) -> Result<Self> {
        use std::io::{Seek, SeekFrom};

        let path = segment_path(dir, ordinal);
        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(size)?;
        file.seek(SeekFrom::Start(size))?;
        Ok(Self {
            ordinal,
            path,
            file: BufWriter::with_capacity(buffer_size.max(1), file),
            size,
        })
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends one frame and returns the byte offset it was written at.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64> {
        let offset = self.size;
        let frame = encode_frame(payload);
        self.file.write_all(&frame)?;
        self.size += frame.len() as u64;
        Ok(offset)
    }

    /// Flushes the user-space buffer and fsyncs the file to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Flushes the user-space buffer without fsyncing.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn names_round_trip() {
        assert_eq!(parse_segment_ordinal(&segment_file_name(0)), Some(0));
        assert_eq!(parse_segment_ordinal(&segment_file_name(42)), Some(42));
        assert_eq!(parse_segment_ordinal("not-a-segment"), None);
    }

    #[test]
    fn encode_frame_includes_crc_and_len() {
        let frame = encode_frame(b"hello");
        assert_eq!(&frame[0..4], &5u32.to_le_bytes());
        assert_eq!(frame.len(), FRAME_PREFIX_LEN + 5);
    }

    #[test]
    fn create_refuses_existing_segment() {
        let dir = TempDir::new().unwrap();
        SegmentWriter::create(dir.path(), 0, 4096).unwrap();
        assert!(SegmentWriter::create(dir.path(), 0, 4096).is_err());
    }

    #[test]
    fn append_tracks_size() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), 0, 4096).unwrap();
        let offset_a = writer.append(b"abc").unwrap();
        let offset_b = writer.append(b"de").unwrap();
        assert_eq!(offset_a, 0);
        assert_eq!(offset_b, (FRAME_PREFIX_LEN + 3) as u64);
        assert_eq!(
            writer.size(),
            (FRAME_PREFIX_LEN + 3 + FRAME_PREFIX_LEN + 2) as u64
        );
    }

    #[test]
    fn resume_truncates_to_requested_size() {
        let dir = TempDir::new().unwrap();
        {
            let mut writer = SegmentWriter::create(dir.path(), 0, 4096).unwrap();
            writer.append(b"abc").unwrap();
            writer.append(b"def").unwrap();
            writer.sync().unwrap();
        }
        let good_len = (FRAME_PREFIX_LEN + 3) as u64;
        let mut resumed = SegmentWriter::resume(dir.path(), 0, good_len, 4096).unwrap();
        assert_eq!(resumed.size(), good_len);
        resumed.append(b"ghi").unwrap();
        resumed.sync().unwrap();
        let metadata = std::fs::metadata(segment_path(dir.path(), 0)).unwrap();
        assert_eq!(metadata.len(), good_len + FRAME_PREFIX_LEN as u64 + 3);
    }
}
