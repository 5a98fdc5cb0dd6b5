use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::wal::segment::FRAME_PREFIX_LEN;

/// Fsync discipline for `Manager::append`/`append_batch` (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Fsync after every append before returning success.
    Immediate,
    /// Fsync after each batch API call (or an explicit `sync()`).
    Batch,
    /// A background timer fsyncs on `sync_interval`; unsynced appends may
    /// be lost on crash.
    Periodic,
}

/// All tunables recognized by the durability core (spec §6 option table).
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the log manager owns exclusively.
    pub data_dir: PathBuf,
    /// Bytes threshold at which a segment is sealed on next append.
    pub segment_size: u64,
    /// Retention cap: oldest sealed segments are pruned beyond this count.
    pub max_segments: usize,
    /// Fsync discipline on append.
    pub sync_policy: SyncPolicy,
    /// Fsync cadence for `SyncPolicy::Periodic`.
    pub sync_interval: Duration,
    /// User-space write buffer size per segment.
    pub buffer_size: usize,
    /// Memtable size at which it becomes flush-eligible.
    pub memtable_max_bytes: u64,
    /// Memtable age at which it becomes flush-eligible.
    pub memtable_max_age: Duration,
    /// Skip-list level cap.
    pub skiplist_max_level: usize,
    /// MVCC chain-length cap per key.
    pub mvcc_max_versions_per_key: usize,
    /// Background MVCC prune cadence.
    pub mvcc_prune_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            segment_size: 64 * 1024 * 1024,
            max_segments: 1024,
            sync_policy: SyncPolicy::Batch,
            sync_interval: Duration::from_millis(100),
            buffer_size: 64 * 1024,
            memtable_max_bytes: 64 * 1024 * 1024,
            memtable_max_age: Duration::from_secs(600),
            skiplist_max_level: 16,
            mvcc_max_versions_per_key: 10,
            mvcc_prune_interval: Duration::from_secs(3600),
        }
    }
}

impl Config {
    /// Checks the config for internally inconsistent values.
    ///
    /// # Errors
    ///
    /// `Error::InvalidConfig` if a segment could never hold a single frame,
    /// or if `skiplist_max_level`/`mvcc_max_versions_per_key` is zero.
    pub fn validate(&self) -> Result<()> {
        let min_segment = FRAME_PREFIX_LEN as u64 + 1;
        if self.segment_size < min_segment {
            return Err(Error::InvalidConfig(
                "segment_size too small to hold one frame",
            ));
        }
        if self.skiplist_max_level == 0 {
            return Err(Error::InvalidConfig("skiplist_max_level must be >= 1"));
        }
        if self.mvcc_max_versions_per_key == 0 {
            return Err(Error::InvalidConfig(
                "mvcc_max_versions_per_key must be >= 1",
            ));
        }
        if self.max_segments == 0 {
            return Err(Error::InvalidConfig("max_segments must be >= 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_tiny_segment_size() {
        let mut config = Config::default();
        config.segment_size = 4;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_zero_skiplist_level() {
        let mut config = Config::default();
        config.skiplist_max_level = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
