//! The ordered in-memory table: composite-key map from a tenant-scoped key
//! plus version to the record written at that version, backed by a
//! lock-free skip list.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_skiplist::SkipMap;

use crate::error::{Error, Result};
use crate::record::Record;

/// Fixed overhead charged per entry on top of its variable-length fields,
/// covering the composite key's length prefixes and the record's scalar
/// fields (sequence, version, timestamp, txn_id, operation tag).
const ENTRY_OVERHEAD_BYTES: u64 = 64;

fn estimate_size(record: &Record) -> u64 {
    ENTRY_OVERHEAD_BYTES
        + record.key.tenant.len() as u64
        + record.key.entity.len() as u64
        + record.payload.len() as u64
}

/// A point-in-time snapshot of a memtable's counters (spec's `metadata()`).
#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    pub size_bytes: u64,
    pub count: u64,
    pub is_immutable: bool,
    pub age: Duration,
}

/// An ordered, concurrent, size-bounded map from composite key to record.
///
/// Mutations (`put`, `seal`) and reads (`get`, `get_latest`, `scan`) are all
/// lock-free against the underlying skip list; `size_bytes` is an
/// approximation maintained with a single atomic counter rather than an
/// exact accounting, the same tradeoff the skip list itself makes for
/// linearizability without a global lock.
pub struct Memtable {
    entries: SkipMap<Vec<u8>, Record>,
    approx_bytes: AtomicU64,
    count: AtomicU64,
    max_bytes: u64,
    sealed: AtomicBool,
    created_at: Instant,
}

impl Memtable {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: SkipMap::new(),
            approx_bytes: AtomicU64::new(0),
            count: AtomicU64::new(0),
            max_bytes,
            sealed: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    /// Inserts or replaces the entry for `record`'s (key, version).
    ///
    /// # Errors
    ///
    /// `Error::Immutable` if the table has been sealed, `Error::Full` if
    /// the insert would push `size_bytes()` past `max_bytes`.
    pub fn put(&self, record: Record) -> Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(Error::Immutable);
        }
        let key = record.key.composite_key(record.version, record.timestamp_ns);
        let new_size = estimate_size(&record);
        let existing_size = self.entries.get(&key).map(|e| estimate_size(e.value()));

        let current = self.approx_bytes.load(Ordering::Acquire);
        let projected = current + new_size - existing_size.unwrap_or(0);
        if projected > self.max_bytes {
            return Err(Error::Full);
        }

        let is_new = existing_size.is_none();
        self.entries.insert(key, record);
        self.approx_bytes.store(projected, Ordering::Release);
        if is_new {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Exact-version lookup.
    pub fn get(&self, tenant: &str, entity: &str, version: u64, timestamp_ns: u64) -> Option<Record> {
        let key = crate::record::Key::new(tenant, entity).ok()?;
        self.entries
            .get(&key.composite_key(version, timestamp_ns))
            .map(|e| e.value().clone())
    }

    /// Returns the record with the highest version for `(tenant, entity)`.
    pub fn get_latest(&self, tenant: &str, entity: &str) -> Option<Record> {
        let key = crate::record::Key::new(tenant, entity).ok()?;
        let prefix = key.sort_prefix();
        self.entries
            .range(prefix.clone()..)
            .take_while(|e| e.key().starts_with(&prefix))
            .last()
            .map(|e| e.value().clone())
    }

    /// Returns entries with composite key in `[start, end)`, in key order.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> impl Iterator<Item = Record> + '_ {
        self.entries
            .range(start.to_vec()..end.to_vec())
            .map(|e| e.value().clone())
    }

    /// Marks the table immutable; subsequent `put` calls return `Immutable`.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_immutable(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn should_flush(&self, max_bytes: u64, max_age: Duration) -> bool {
        self.size_bytes() >= max_bytes || self.created_at.elapsed() >= max_age
    }

    pub fn size_bytes(&self) -> u64 {
        self.approx_bytes.load(Ordering::Acquire)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn metadata(&self) -> Metadata {
        Metadata {
            size_bytes: self.size_bytes(),
            count: self.count(),
            is_immutable: self.is_immutable(),
            age: self.created_at.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Key, Operation};

    fn record(tenant: &str, entity: &str, version: u64, payload: &[u8]) -> Record {
        Record {
            key: Key::new(tenant, entity).unwrap(),
            operation: Operation::Insert,
            payload: payload.to_vec(),
            version,
            sequence: version,
            timestamp_ns: version * 10,
            txn_id: 0,
        }
    }

    #[test]
    fn put_then_get_latest() {
        let table = Memtable::new(1024 * 1024);
        table.put(record("t", "e", 1, b"v1")).unwrap();
        table.put(record("t", "e", 2, b"v2")).unwrap();
        let latest = table.get_latest("t", "e").unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.payload, b"v2");
    }

    #[test]
    fn get_exact_version() {
        let table = Memtable::new(1024 * 1024);
        table.put(record("t", "e", 1, b"v1")).unwrap();
        table.put(record("t", "e", 2, b"v2")).unwrap();
        let got = table.get("t", "e", 1, 10).unwrap();
        assert_eq!(got.payload, b"v1");
    }

    #[test]
    fn seal_rejects_put() {
        let table = Memtable::new(1024 * 1024);
        table.seal();
        assert!(matches!(
            table.put(record("t", "e", 1, b"v1")),
            Err(Error::Immutable)
        ));
    }

    #[test]
    fn full_when_over_budget() {
        let table = Memtable::new(10);
        assert!(matches!(
            table.put(record("t", "e", 1, b"this payload is too big")),
            Err(Error::Full)
        ));
    }

    #[test]
    fn scan_returns_composite_key_order() {
        let table = Memtable::new(1024 * 1024);
        table.put(record("a", "1", 1, b"x")).unwrap();
        table.put(record("a", "2", 1, b"y")).unwrap();
        table.put(record("b", "1", 1, b"z")).unwrap();
        let all: Vec<_> = table.scan(&[], &[0xFF; 64]).collect();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].key.tenant, "a");
        assert_eq!(all[2].key.tenant, "b");
    }

    #[test]
    fn should_flush_on_size() {
        let table = Memtable::new(1024 * 1024);
        table.put(record("t", "e", 1, b"v1")).unwrap();
        assert!(table.should_flush(1, Duration::from_secs(3600)));
        assert!(!table.should_flush(u64::MAX, Duration::from_secs(3600)));
    }

    #[test]
    fn replacing_same_version_does_not_double_count() {
        let table = Memtable::new(1024 * 1024);
        table.put(record("t", "e", 1, b"v1")).unwrap();
        table.put(record("t", "e", 1, b"v1-again")).unwrap();
        assert_eq!(table.count(), 1);
    }
}
