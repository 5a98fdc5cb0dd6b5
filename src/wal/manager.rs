//! The log manager: owns a directory of segments, rotation, recovery, and
//! retention. `wal::segment`/`wal::reader` are the stateless file-level
//! primitives this module coordinates.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::config::{Config, SyncPolicy};
use crate::error::{Error, Result};
use crate::record::{self, Record};
use crate::wal::reader::{FrameRead, SegmentReader};
use crate::wal::segment::{self, SegmentWriter};

/// Per-segment bookkeeping the manager keeps once a segment is sealed:
/// its byte size and the highest sequence number it contains, used by
/// retention to decide what is safe to delete.
#[derive(Debug, Clone, Copy)]
struct SealedSegment {
    size: u64,
    max_sequence: u64,
}

struct ActiveState {
    writer: SegmentWriter,
    max_sequence: u64,
    sealed: BTreeMap<u64, SealedSegment>,
}

/// What happened while recovering the on-disk state at `Manager::open`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenReport {
    /// A trailing partial/corrupt frame was found in the newest segment and
    /// truncated away. Not an error: this is the expected shape of a crash
    /// mid-append.
    pub torn_tail: bool,
    /// Bytes discarded from the newest segment because of the torn tail.
    pub truncated_bytes: u64,
    pub segments_found: usize,
}

/// What happened during a `Manager::replay` pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayReport {
    pub records_replayed: u64,
    pub cancelled: bool,
}

/// A snapshot of manager-level counters (spec's `stats()` operation).
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub segment_count: usize,
    pub active_segment_size: u64,
    pub total_bytes: u64,
    pub oldest_ordinal: u64,
    pub newest_ordinal: u64,
    pub next_sequence: u64,
    pub retention_floor: u64,
}

/// Owns a directory of WAL segments: rotation, append, replay, and
/// retention. Cheaply cloneable; clones share the same underlying state.
pub struct Manager {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    config: Config,
    state: Mutex<ActiveState>,
    next_sequence: AtomicU64,
    retention_floor: AtomicU64,
    closed: AtomicBool,
    periodic: Mutex<Option<PeriodicSync>>,
}

struct PeriodicSync {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

impl Manager {
    /// Opens (and if necessary creates) the segment directory, replaying
    /// just enough of the newest segment to detect and truncate a torn
    /// tail. Full replay into a memtable/resolver is a separate step the
    /// caller drives via `replay`.
    pub fn open(config: Config) -> Result<(Self, OpenReport)> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let mut ordinals = Vec::new();
        for entry in fs::read_dir(&config.data_dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(ordinal) = segment::parse_segment_ordinal(name) {
                    ordinals.push(ordinal);
                }
            }
        }
        ordinals.sort_unstable();

        let mut report = OpenReport {
            segments_found: ordinals.len(),
            ..Default::default()
        };

        let mut sealed = BTreeMap::new();
        let mut next_sequence = 1u64;

        if ordinals.is_empty() {
            let writer = SegmentWriter::create(&config.data_dir, 0, config.buffer_size)?;
            let inner = Inner {
                dir: config.data_dir.clone(),
                config: config.clone(),
                state: Mutex::new(ActiveState {
                    writer,
                    max_sequence: 0,
                    sealed,
                }),
                next_sequence: AtomicU64::new(1),
                retention_floor: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                periodic: Mutex::new(None),
            };
            let manager = Self::from_inner(inner, &config)?;
            return Ok((manager, report));
        }

        let last_ordinal = *ordinals.last().unwrap();
        for &ordinal in &ordinals {
            let path = segment::segment_path(&config.data_dir, ordinal);
            let mut reader = SegmentReader::open(&path)?;
            let mut max_sequence = 0u64;
            let mut verified_offset = 0u64;
            let is_last = ordinal == last_ordinal;

            loop {
                match reader.next_frame() {
                    Ok(FrameRead::Frame(payload)) => {
                        let entry = record::decode_entry(&payload)?;
                        max_sequence = max_sequence.max(entry.sequence);
                        next_sequence = next_sequence.max(entry.sequence + 1);
                        verified_offset = reader.offset();
                    }
                    Ok(FrameRead::Eof) => break,
                    Ok(FrameRead::Torn) => {
                        if !is_last {
                            return Err(Error::CorruptSegment(
                                "torn frame in a non-terminal segment",
                            ));
                        }
                        let full_size = fs::metadata(&path)?.len();
                        report.torn_tail = true;
                        report.truncated_bytes = full_size - verified_offset;
                        log::warn!(
                            "torn tail in segment {ordinal}: truncating {} bytes",
                            report.truncated_bytes
                        );
                        fs::File::options()
                            .write(true)
                            .open(&path)?
                            .set_len(verified_offset)?;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }

            if is_last {
                let writer = SegmentWriter::resume(
                    &config.data_dir,
                    ordinal,
                    verified_offset,
                    config.buffer_size,
                )?;
                let inner = Inner {
                    dir: config.data_dir.clone(),
                    config: config.clone(),
                    state: Mutex::new(ActiveState {
                        writer,
                        max_sequence,
                        sealed,
                    }),
                    next_sequence: AtomicU64::new(next_sequence),
                    retention_floor: AtomicU64::new(0),
                    closed: AtomicBool::new(false),
                    periodic: Mutex::new(None),
                };
                let manager = Self::from_inner(inner, &config)?;
                return Ok((manager, report));
            } else {
                sealed.insert(
                    ordinal,
                    SealedSegment {
                        size: verified_offset,
                        max_sequence,
                    },
                );
            }
        }
        unreachable!("loop above always returns on the last ordinal");
    }

    fn from_inner(inner: Inner, config: &Config) -> Result<Self> {
        let manager = Self {
            inner: Arc::new(inner),
        };
        if config.sync_policy == SyncPolicy::Periodic {
            manager.start_periodic_sync(config.sync_interval);
        }
        Ok(manager)
    }

    fn start_periodic_sync(&self, interval: Duration) {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_for_thread = Arc::clone(&stop);
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::spawn(move || loop {
            let (lock, cvar) = &*stop_for_thread;
            let guard = lock.lock().unwrap();
            let (guard, timeout) = cvar.wait_timeout(guard, interval).unwrap();
            if *guard {
                return;
            }
            drop(timeout);
            if let Ok(mut state) = inner.state.lock() {
                if let Err(err) = state.writer.sync() {
                    log::error!("periodic sync failed: {err}");
                }
            }
        });
        *self.inner.periodic.lock().unwrap() = Some(PeriodicSync { stop, handle });
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Reserves the next sequence number for a new record. Called by the
    /// glue layer before encoding so the record carries its final sequence.
    pub fn next_sequence(&self) -> u64 {
        self.inner.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Appends one already-encoded entry, rotating the active segment first
    /// if it would not fit. Returns the `(ordinal, offset)` it was written
    /// at.
    pub fn append(&self, payload: &[u8]) -> Result<(u64, u64)> {
        self.check_open()?;
        let mut state = self.inner.state.lock().unwrap();
        self.rotate_if_needed(&mut state, payload.len())?;

        let sequence_entry = record::decode_entry(payload)?;
        let offset = state.writer.append(payload)?;
        state.max_sequence = state.max_sequence.max(sequence_entry.sequence);

        if self.inner.config.sync_policy == SyncPolicy::Immediate {
            state.writer.sync()?;
        } else {
            state.writer.flush()?;
        }
        Ok((state.writer.ordinal(), offset))
    }

    /// Appends a batch of already-encoded entries. Under `SyncPolicy::Batch`
    /// the batch is flushed to the OS but only fsynced if the caller follows
    /// up with `sync()`; under `Immediate` every entry is fsynced as it's
    /// written; under `Periodic` durability is left to the background timer.
    pub fn append_batch(&self, payloads: &[Vec<u8>]) -> Result<Vec<(u64, u64)>> {
        self.check_open()?;
        let mut results = Vec::with_capacity(payloads.len());
        for payload in payloads {
            results.push(self.append(payload)?);
        }
        Ok(results)
    }

    /// Forces an fsync of the active segment now.
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock().unwrap();
        state.writer.sync()
    }

    fn rotate_if_needed(&self, state: &mut ActiveState, next_frame_payload_len: usize) -> Result<()> {
        let next_frame_len = (segment::FRAME_PREFIX_LEN + next_frame_payload_len) as u64;
        if state.writer.size() == 0 || state.writer.size() + next_frame_len <= self.inner.config.segment_size {
            return Ok(());
        }
        state.writer.sync()?;
        let sealed_ordinal = state.writer.ordinal();
        state.sealed.insert(
            sealed_ordinal,
            SealedSegment {
                size: state.writer.size(),
                max_sequence: state.max_sequence,
            },
        );
        let new_ordinal = sealed_ordinal + 1;
        let new_writer = SegmentWriter::create(&self.inner.dir, new_ordinal, self.inner.config.buffer_size)?;
        state.writer = new_writer;
        Ok(())
    }

    /// Replays every record in every segment, oldest first, calling
    /// `visitor` for each. Used at startup to rehydrate the memtable and
    /// version resolver. Checks `cancel` between records.
    pub fn replay(
        &self,
        cancel: &CancellationToken,
        mut visitor: impl FnMut(Record) -> Result<()>,
    ) -> Result<ReplayReport> {
        self.check_open()?;
        let mut report = ReplayReport::default();
        let mut ordinals: Vec<u64> = fs::read_dir(&self.inner.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(segment::parse_segment_ordinal))
            .collect();
        ordinals.sort_unstable();

        for ordinal in ordinals {
            let path = segment::segment_path(&self.inner.dir, ordinal);
            let mut reader = SegmentReader::open(&path)?;
            loop {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    return Ok(report);
                }
                match reader.next_frame()? {
                    FrameRead::Frame(payload) => {
                        let entry = record::decode_entry(&payload)?;
                        visitor(entry)?;
                        report.records_replayed += 1;
                    }
                    FrameRead::Eof => break,
                    FrameRead::Torn => break,
                }
            }
        }
        Ok(report)
    }

    /// Advances the retention floor. Segments whose highest sequence number
    /// is below `sequence` become eligible for deletion on the next
    /// retention pass. The host is responsible for only advancing this past
    /// sequences it has durably checkpointed elsewhere (e.g. a flushed
    /// memtable).
    pub fn set_retention_floor(&self, sequence: u64) {
        self.inner.retention_floor.fetch_max(sequence, Ordering::SeqCst);
    }

    /// Deletes sealed segments that are either below the retention floor or
    /// past `max_segments` retained (oldest first), whichever is larger.
    /// Never deletes the active segment.
    pub fn checkpoint(&self) -> Result<Vec<u64>> {
        self.check_open()?;
        let mut state = self.inner.state.lock().unwrap();
        let floor = self.inner.retention_floor.load(Ordering::SeqCst);

        let below_floor: std::collections::BTreeSet<u64> = state
            .sealed
            .iter()
            .filter(|(_, seg)| seg.max_sequence < floor)
            .map(|(&ordinal, _)| ordinal)
            .collect();

        // `max_segments` counts the active segment, so at most
        // `max_segments - 1` sealed segments may be kept.
        let keep_sealed = self.inner.config.max_segments.saturating_sub(1);
        let over_budget_count = state.sealed.len().saturating_sub(keep_sealed);
        let over_budget: std::collections::BTreeSet<u64> = state
            .sealed
            .keys()
            .copied()
            .take(over_budget_count)
            .collect();

        let to_delete: Vec<u64> = below_floor.union(&over_budget).copied().collect();

        for &ordinal in &to_delete {
            let path = segment::segment_path(&self.inner.dir, ordinal);
            fs::remove_file(&path)?;
            state.sealed.remove(&ordinal);
            log::info!("retention removed segment {ordinal}");
        }
        Ok(to_delete)
    }

    pub fn stats(&self) -> Stats {
        let state = self.inner.state.lock().unwrap();
        let sealed_bytes: u64 = state.sealed.values().map(|s| s.size).sum();
        let oldest = state.sealed.keys().next().copied().unwrap_or(state.writer.ordinal());
        Stats {
            segment_count: state.sealed.len() + 1,
            active_segment_size: state.writer.size(),
            total_bytes: sealed_bytes + state.writer.size(),
            oldest_ordinal: oldest,
            newest_ordinal: state.writer.ordinal(),
            next_sequence: self.inner.next_sequence.load(Ordering::SeqCst),
            retention_floor: self.inner.retention_floor.load(Ordering::SeqCst),
        }
    }

    /// Flushes and fsyncs the active segment, then marks the manager
    /// closed. Further operations return `Error::Closed`.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(periodic) = self.inner.periodic.lock().unwrap().take() {
            {
                let (lock, cvar) = &*periodic.stop;
                *lock.lock().unwrap() = true;
                cvar.notify_all();
            }
            let _ = periodic.handle.join();
        }
        let mut state = self.inner.state.lock().unwrap();
        state.writer.sync()
    }
}

impl Clone for Manager {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Ok(mut state) = self.state.lock() {
                let _ = state.writer.sync();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Key, Operation};
    use tempfile::TempDir;

    fn encoded(sequence: u64, payload: &[u8]) -> Vec<u8> {
        record::encode_entry(&Record {
            key: Key::new("t", "e").unwrap(),
            operation: Operation::Insert,
            payload: payload.to_vec(),
            version: sequence,
            sequence,
            timestamp_ns: 0,
            txn_id: 0,
        })
    }

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.segment_size = 200;
        config
    }

    #[test]
    fn open_creates_first_segment() {
        let dir = TempDir::new().unwrap();
        let (manager, report) = Manager::open(config(&dir)).unwrap();
        assert!(!report.torn_tail);
        assert_eq!(manager.stats().segment_count, 1);
    }

    #[test]
    fn append_and_replay_round_trips() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = Manager::open(config(&dir)).unwrap();
        for i in 0..5 {
            manager.append(&encoded(i, b"payload")).unwrap();
        }
        manager.sync().unwrap();

        let mut seen = Vec::new();
        let report = manager
            .replay(&CancellationToken::new(), |record| {
                seen.push(record.sequence);
                Ok(())
            })
            .unwrap();
        assert_eq!(report.records_replayed, 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn rotation_creates_new_segment() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = Manager::open(config(&dir)).unwrap();
        for i in 0..20 {
            manager.append(&encoded(i, b"0123456789012345")).unwrap();
        }
        assert!(manager.stats().segment_count > 1);
    }

    #[test]
    fn torn_tail_recovered_on_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let (manager, _) = Manager::open(config(&dir)).unwrap();
            manager.append(&encoded(0, b"good")).unwrap();
            manager.sync().unwrap();
        }
        let path = segment::segment_path(dir.path(), 0);
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        use std::io::Write as _;
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&0u32.to_le_bytes()).unwrap();
        file.write_all(b"not enough bytes").unwrap();
        drop(file);

        let (manager, report) = Manager::open(config(&dir)).unwrap();
        assert!(report.torn_tail);
        let mut seen = 0;
        manager
            .replay(&CancellationToken::new(), |_| {
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn retention_floor_allows_checkpoint_cleanup() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.max_segments = 1000;
        let (manager, _) = Manager::open(cfg).unwrap();
        for i in 0..20 {
            manager.append(&encoded(i, b"0123456789012345")).unwrap();
        }
        let sealed_before = manager.stats().segment_count;
        assert!(sealed_before > 1);
        manager.set_retention_floor(19);
        let deleted = manager.checkpoint().unwrap();
        assert!(!deleted.is_empty());
    }

    #[test]
    fn closed_manager_rejects_append() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = Manager::open(config(&dir)).unwrap();
        manager.close().unwrap();
        assert!(matches!(manager.append(&encoded(0, b"x")), Err(Error::Closed)));
    }
}
