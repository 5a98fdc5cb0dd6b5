//! E3: truncating bytes off the tail of the newest segment does not fail
//! open; it silently drops the incomplete frame and recovery continues
//! from whatever was fully written.

use stratum_core::cancel::CancellationToken;
use stratum_core::config::Config;
use stratum_core::record::{self, Key, Operation, Record};
use stratum_core::wal::Manager;
use tempfile::tempdir;
use std::fs::OpenOptions;

#[test]
fn torn_tail_recovery() {
    let dir = tempdir().expect("tempdir");
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();

    let segment_path;
    {
        let (manager, _) = Manager::open(config.clone()).expect("open");
        let sequence = manager.next_sequence();
        let record = Record {
            key: Key::new("t", "e").unwrap(),
            operation: Operation::Insert,
            payload: vec![0x41, 0x42],
            version: sequence,
            sequence,
            timestamp_ns: 1000,
            txn_id: 0,
        };
        manager.append(&record::encode_entry(&record)).expect("append");
        manager.sync().expect("sync");
        segment_path = stratum_core::wal::segment_path(&config.data_dir, 0);
    }

    let full_len = std::fs::metadata(&segment_path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&segment_path).unwrap();
    file.set_len(full_len - 3).unwrap();
    drop(file);

    let (manager, report) = Manager::open(config).expect("reopen after torn tail");
    assert!(report.torn_tail);

    let mut seen = Vec::new();
    manager
        .replay(&CancellationToken::new(), |entry| {
            seen.push(entry);
            Ok(())
        })
        .expect("replay");
    assert!(seen.is_empty());
    assert_eq!(manager.stats().next_sequence, 1);
}
