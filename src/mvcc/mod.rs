//! The MVCC version resolver: a per-key chain of versions, newest first,
//! backed by a skip list of per-key chain locks. The core only exposes
//! these primitives; a caller builds transaction semantics (snapshot
//! isolation, OCC commit) on top of `get_version`/`has_conflict`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_skiplist::SkipMap;

use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// One version in a key's chain. `value: None` marks a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub version: u64,
    pub value: Option<Vec<u8>>,
    pub timestamp_ns: u64,
    pub txn_id: u64,
}

impl Version {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Debug, Default)]
struct VersionChain(Vec<Version>);

/// A resolver-level counter snapshot (used for operational visibility, not
/// required by any public contract beyond `stats()`).
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub chain_count: u64,
    pub total_versions: u64,
    pub next_version: u64,
}

/// Per-key version chains plus the global monotonic version counter.
pub struct Resolver {
    chains: SkipMap<Vec<u8>, Mutex<VersionChain>>,
    next_version: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            chains: SkipMap::new(),
            next_version: AtomicU64::new(1),
            clock,
        }
    }

    /// Atomically returns and increments the global version counter.
    pub fn next_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    fn push_entry(&self, key: Vec<u8>, entry: Version) {
        self.next_version.fetch_max(entry.version + 1, Ordering::SeqCst);
        let chain_entry = self.chains.get_or_insert(key, Mutex::new(VersionChain::default()));
        let mut chain = chain_entry.value().lock().unwrap();
        chain.0.insert(0, entry);
    }

    fn push(&self, key: Vec<u8>, value: Option<Vec<u8>>, txn_id: u64) -> u64 {
        let version = self.next_version();
        let timestamp_ns = self.clock.now();
        self.push_entry(
            key,
            Version {
                version,
                value,
                timestamp_ns,
                txn_id,
            },
        );
        version
    }

    /// Assigns a new version and appends it to `key`'s chain.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, txn_id: u64) -> u64 {
        self.push(key, Some(value), txn_id)
    }

    /// Appends a tombstone version to `key`'s chain.
    pub fn delete(&self, key: Vec<u8>, txn_id: u64) -> u64 {
        self.push(key, None, txn_id)
    }

    /// Inserts a version that was already assigned elsewhere (the WAL entry
    /// it came from durably records the version number). Used by recovery
    /// replay and by the glue layer, which must reserve a version before
    /// the WAL append so the entry can carry it, then land that exact
    /// version in the resolver once the append is durable. Advances the
    /// counter past `version` if it hasn't already reached there.
    pub fn restore_version(&self, key: Vec<u8>, version: Version) {
        self.push_entry(key, version);
    }

    /// Returns the newest non-tombstone version, or `None` if the chain is
    /// empty or its newest version is a tombstone.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let entry = self.chains.get(key)?;
        let chain = entry.value().lock().unwrap();
        chain.0.first().and_then(|v| v.value.clone())
    }

    /// Exact-version lookup; `None` if absent or a tombstone.
    pub fn get_version(&self, key: &[u8], version: u64) -> Option<Vec<u8>> {
        let entry = self.chains.get(key)?;
        let chain = entry.value().lock().unwrap();
        chain
            .0
            .iter()
            .find(|v| v.version == version)
            .and_then(|v| v.value.clone())
    }

    /// Returns the value visible at time `t`: the value of the newest
    /// version whose creation timestamp is at most `t`, or `None` if that
    /// version is a tombstone or no version is that old yet. Timestamps are
    /// wall-clock and subject to skew (spec §9).
    pub fn get_at_time(&self, key: &[u8], t: u64) -> Option<Vec<u8>> {
        let entry = self.chains.get(key)?;
        let chain = entry.value().lock().unwrap();
        chain
            .0
            .iter()
            .find(|v| v.timestamp_ns <= t)
            .and_then(|v| v.value.clone())
    }

    /// Full chain for `key`, newest-first. Empty if the key has no chain.
    pub fn list_versions(&self, key: &[u8]) -> Vec<Version> {
        match self.chains.get(key) {
            Some(entry) => entry.value().lock().unwrap().0.clone(),
            None => Vec::new(),
        }
    }

    /// `true` iff `key`'s chain contains a version whose `txn_id` is
    /// neither `base_txn` nor `current_txn` — the OCC write-conflict check.
    pub fn has_conflict(&self, key: &[u8], base_txn: u64, current_txn: u64) -> bool {
        let Some(entry) = self.chains.get(key) else {
            return false;
        };
        let chain = entry.value().lock().unwrap();
        chain
            .0
            .iter()
            .any(|v| v.txn_id != base_txn && v.txn_id != current_txn)
    }

    /// For every chain longer than `k_max`, drops the oldest versions,
    /// except any version still needed to resolve `oldest_live_snapshot`
    /// (the newest version at or below that snapshot must survive even if
    /// it falls outside the `k_max` newest). Checks `cancel` between
    /// chains.
    pub fn prune(
        &self,
        k_max: usize,
        oldest_live_snapshot: u64,
        cancel: &CancellationToken,
    ) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        for entry in self.chains.iter() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(report);
            }
            report.chains_examined += 1;
            let mut chain = entry.value().lock().unwrap();
            report.versions_dropped += prune_chain(&mut chain, k_max, oldest_live_snapshot);
        }
        Ok(report)
    }

    /// Removes every chain. Intended for use after a checkpoint has
    /// durably captured resolver state elsewhere.
    pub fn clear(&self) {
        self.chains.clear();
    }

    pub fn stats(&self) -> Stats {
        let mut chain_count = 0u64;
        let mut total_versions = 0u64;
        for entry in self.chains.iter() {
            chain_count += 1;
            total_versions += entry.value().lock().unwrap().0.len() as u64;
        }
        Stats {
            chain_count,
            total_versions,
            next_version: self.next_version.load(Ordering::SeqCst),
        }
    }

    /// Serializes every chain to the checkpoint format of spec §6: a
    /// `(chain_count, next_version)` header followed by each chain's key
    /// and versions, all little-endian and length-prefixed.
    pub fn serialize(&self) -> Vec<u8> {
        let snapshot: Vec<(Vec<u8>, Vec<Version>)> = self
            .chains
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().unwrap().0.clone()))
            .collect();

        let mut out = Vec::new();
        out.extend_from_slice(&(snapshot.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.next_version.load(Ordering::SeqCst).to_le_bytes());

        for (key, versions) in &snapshot {
            out.extend_from_slice(&(key.len() as u32).to_le_bytes());
            out.extend_from_slice(key);
            out.extend_from_slice(&(versions.len() as u32).to_le_bytes());
            for version in versions {
                let value = version.value.as_deref().unwrap_or(&[]);
                out.extend_from_slice(&(key.len() as u32).to_le_bytes());
                out.extend_from_slice(key);
                out.extend_from_slice(&(value.len() as u32).to_le_bytes());
                out.extend_from_slice(value);
                out.extend_from_slice(&version.version.to_le_bytes());
                let unix_seconds = (version.timestamp_ns / 1_000_000_000) as i64;
                out.extend_from_slice(&unix_seconds.to_le_bytes());
                out.push(version.is_tombstone() as u8);
                out.extend_from_slice(&version.txn_id.to_le_bytes());
            }
        }
        out
    }

    /// Rebuilds a resolver from bytes produced by `serialize`. Sub-second
    /// timestamp precision does not survive the round trip (the checkpoint
    /// format stores whole unix seconds).
    pub fn deserialize(bytes: &[u8], clock: Arc<dyn Clock>) -> Result<Self> {
        let mut cursor = Reader::new(bytes);
        let chain_count = cursor.take_u64()?;
        let next_version = cursor.take_u64()?;

        let chains = SkipMap::new();
        for _ in 0..chain_count {
            let _key_hash = cursor.take_bytes()?;
            let version_count = cursor.take_u32()?;
            let mut chain = VersionChain::default();
            let mut chain_key = Vec::new();
            for _ in 0..version_count {
                let key = cursor.take_bytes()?.to_vec();
                let value = cursor.take_bytes()?.to_vec();
                let version = cursor.take_u64()?;
                let unix_seconds = cursor.take_i64()?;
                let deleted = cursor.take_u8()? != 0;
                let txn_id = cursor.take_u64()?;
                chain_key = key;
                chain.0.push(Version {
                    version,
                    value: if deleted { None } else { Some(value) },
                    timestamp_ns: (unix_seconds.max(0) as u64) * 1_000_000_000,
                    txn_id,
                });
            }
            if !chain_key.is_empty() || version_count > 0 {
                chains.insert(chain_key, Mutex::new(chain));
            }
        }

        Ok(Self {
            chains,
            next_version: AtomicU64::new(next_version),
            clock,
        })
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

fn prune_chain(chain: &mut VersionChain, k_max: usize, oldest_live_snapshot: u64) -> u64 {
    if chain.0.len() <= k_max {
        return 0;
    }
    let protect_idx = chain.0.iter().position(|v| v.version <= oldest_live_snapshot);
    let mut keep: Vec<Version> = chain.0[..k_max].to_vec();
    if let Some(idx) = protect_idx {
        if idx >= k_max {
            keep.push(chain.0[idx].clone());
        }
    }
    let dropped = (chain.0.len() - keep.len()) as u64;
    chain.0 = keep;
    dropped
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PruneReport {
    pub chains_examined: u64,
    pub versions_dropped: u64,
    pub cancelled: bool,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(crate::error::Error::SerializationError("length overflow"))?;
        if end > self.buf.len() {
            return Err(crate::error::Error::SerializationError(
                "checkpoint buffer truncated",
            ));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.take_u32()? as usize;
        self.take(len)
    }
}
