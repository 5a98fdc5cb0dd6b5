//! Invariant 12: `close()` and `checkpoint()` tolerate repeated calls.

use stratum_core::config::Config;
use stratum_core::record::{self, Key, Operation, Record};
use stratum_core::wal::Manager;
use tempfile::tempdir;

#[test]
fn idempotent_close_and_checkpoint() {
    let dir = tempdir().expect("tempdir");
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.segment_size = 128;

    let (manager, _) = Manager::open(config).expect("open");
    for i in 0..20u64 {
        let record = Record {
            key: Key::new("t", "e").unwrap(),
            operation: Operation::Insert,
            payload: vec![0u8; 32],
            version: i,
            sequence: manager.next_sequence(),
            timestamp_ns: 0,
            txn_id: 0,
        };
        manager.append(&record::encode_entry(&record)).expect("append");
    }

    manager.set_retention_floor(15);
    manager.checkpoint().expect("first checkpoint");
    manager.checkpoint().expect("second checkpoint is a no-op, not an error");

    manager.close().expect("first close");
    manager.close().expect("second close is a no-op, not an error");
}
