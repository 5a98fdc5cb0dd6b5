//! Glue and recovery orchestration: wires the log, memtable, and resolver
//! together into the single read/write surface a caller actually uses.
//!
//! On open: open segments, replay the log in sequence order to repopulate
//! both the memtable and the resolver, then mark recovery complete. On
//! close: flush, sync, close. Everything here is "thin" sequencing of the
//! three components' own operations (spec §2's glue & recovery share).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::memtable::Memtable;
use crate::mvcc::{Resolver, Version};
use crate::record::{self, Key, Operation, Record};
use crate::wal::{Manager, OpenReport, ReplayReport};

/// Everything learned while bringing a `Db` up to its last durable state.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryReport {
    pub open: OpenReport,
    pub replay: ReplayReport,
}

/// The durability core's single entry point: a log, a memtable, and a
/// resolver kept consistent with each other.
pub struct Db {
    manager: Manager,
    memtable: Memtable,
    resolver: Resolver,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl Db {
    /// Opens (creating if needed) the data directory, replays the log to
    /// rebuild the memtable and resolver, and returns a ready-to-use `Db`.
    pub fn open(config: Config) -> Result<(Self, RecoveryReport)> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<(Self, RecoveryReport)> {
        let (manager, open_report) = Manager::open(config.clone())?;
        let memtable = Memtable::new(config.memtable_max_bytes);
        let resolver = Resolver::with_clock(Arc::clone(&clock));

        let replay_report = manager.replay(&CancellationToken::new(), |entry: Record| {
            memtable.put(entry.clone())?;
            let logical_key = entry.key.sort_prefix();
            let value = if entry.operation.is_tombstone() {
                None
            } else {
                Some(entry.payload.clone())
            };
            resolver.restore_version(
                logical_key,
                Version {
                    version: entry.version,
                    value,
                    timestamp_ns: entry.timestamp_ns,
                    txn_id: entry.txn_id,
                },
            );
            Ok(())
        })?;

        Ok((
            Self {
                manager,
                memtable,
                resolver,
                clock,
                closed: AtomicBool::new(false),
            },
            RecoveryReport {
                open: open_report,
                replay: replay_report,
            },
        ))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Appends one mutation: reserves a version and sequence, durably logs
    /// it, installs it into the memtable, then lands it in the resolver.
    /// Returns `(sequence, version)`.
    pub fn append(
        &self,
        key: Key,
        operation: Operation,
        payload: Vec<u8>,
        txn_id: u64,
    ) -> Result<(u64, u64)> {
        self.check_open()?;

        let version = self.resolver.next_version();
        let timestamp_ns = self.clock.now();
        let sequence = self.manager.next_sequence();

        let record = Record {
            key,
            operation,
            payload,
            version,
            sequence,
            timestamp_ns,
            txn_id,
        };

        self.manager.append(&record::encode_entry(&record))?;
        self.memtable.put(record.clone())?;

        let logical_key = record.key.sort_prefix();
        let value = if operation.is_tombstone() {
            None
        } else {
            Some(record.payload.clone())
        };
        self.resolver.restore_version(
            logical_key,
            Version {
                version,
                value,
                timestamp_ns,
                txn_id,
            },
        );

        Ok((sequence, version))
    }

    /// Reads a key through the resolver: `snapshot_version = None` reads
    /// the newest non-tombstone value, `Some(v)` reads the value visible
    /// as of version `v`.
    pub fn get(&self, key: &Key, snapshot_version: Option<u64>) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let logical_key = key.sort_prefix();
        Ok(match snapshot_version {
            None => self.resolver.get(&logical_key),
            Some(version) => self.resolver.get_version(&logical_key, version),
        })
    }

    /// Fsyncs the active WAL segment. Needed under `SyncPolicy::Batch` to
    /// turn a batch of appends durable.
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        self.manager.sync()
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn memtable(&self) -> &Memtable {
        &self.memtable
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Flushes, syncs, and closes the log manager.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.manager.close()
    }
}
