//! Forward cursor over a segment's frames.
//!
//! One `SegmentReader` reads a single segment file from front to back. The
//! log manager composes several of these, one per segment in ordinal order,
//! to serve both `read_from` (a live cursor a caller holds open) and
//! `replay` (a one-shot pass at startup).

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crc32fast::Hasher;

use crate::error::Result;
use crate::wal::segment::FRAME_PREFIX_LEN;

/// The outcome of attempting to read the next frame.
pub enum FrameRead {
    /// A complete, checksum-verified frame.
    Frame(Vec<u8>),
    /// Zero bytes remained; the segment ends cleanly at a frame boundary.
    Eof,
    /// Fewer bytes remained than a full frame needs. Only a well-formed
    /// state on the newest segment, where it means the process crashed
    /// mid-write; the manager truncates to the last good offset and treats
    /// the rest as absent. On any earlier segment this is corruption.
    Torn,
}

/// Reads frames sequentially out of one segment file.
pub struct SegmentReader {
    reader: BufReader<File>,
    offset: u64,
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_at(path, 0)
    }

    /// Opens a segment positioned at a byte offset (used to resume a live
    /// cursor, or to skip frames already accounted for during replay).
    pub fn open_at(path: &Path, offset: u64) -> Result<Self> {
        use std::io::{Seek, SeekFrom};
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset))?;
        Ok(Self { reader, offset })
    }

    /// Byte offset of the next frame to be read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Attempts to read the next frame. Never returns `Err` for a torn or
    /// absent tail; callers distinguish those via `FrameRead::Torn`/`Eof`.
    /// Returns `Err(Error::CorruptSegment)` only for a complete frame whose
    /// checksum fails to verify.
    pub fn next_frame(&mut self) -> Result<FrameRead> {
        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        let read = read_up_to(&mut self.reader, &mut prefix)?;
        if read == 0 {
            return Ok(FrameRead::Eof);
        }
        if read < FRAME_PREFIX_LEN {
            return Ok(FrameRead::Torn);
        }

        let len = u32::from_le_bytes(prefix[0..4].try_into().unwrap()) as usize;
        let expected_crc = u32::from_le_bytes(prefix[4..8].try_into().unwrap());

        let mut payload = vec![0u8; len];
        let read = read_up_to(&mut self.reader, &mut payload)?;
        if read < len {
            return Ok(FrameRead::Torn);
        }

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            return Err(crate::error::Error::CorruptSegment(
                "frame checksum mismatch",
            ));
        }

        self.offset += (FRAME_PREFIX_LEN + len) as u64;
        Ok(FrameRead::Frame(payload))
    }
}

/// Like `Read::read_exact` but returns the number of bytes actually read
/// instead of erroring on a short read, so the caller can tell a torn tail
/// from an I/O failure.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}
