//! Crash-recoverable, versioned key-value durability core.
//!
//! Three components, leaves first: a segmented write-ahead log (`wal`), an
//! ordered in-memory table (`memtable`), and an MVCC version resolver
//! (`mvcc`). `db` is the glue that wires them together for crash recovery.
//! Everything else — network front-ends, columnar format, query planning —
//! is out of scope; this crate exposes only the operations below.

pub mod cancel;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod memtable;
pub mod mvcc;
pub mod record;
pub mod wal;

pub use cancel::CancellationToken;
pub use clock::{Clock, SystemClock};
pub use config::{Config, SyncPolicy};
pub use db::{Db, RecoveryReport};
pub use error::{Error, Result};
pub use memtable::Memtable;
pub use mvcc::{PruneReport, Resolver, Version};
pub use record::{Key, Operation, Record};
pub use wal::{Manager, OpenReport, ReplayReport};
