//! Cooperative cancellation handle for long-running operations.
//!
//! `replay` and `prune` are the only operations spec §5 requires to check
//! this between records/chains; everything else completes quickly enough
//! that a handle would only add overhead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cheaply cloneable flag a caller can set to ask a long operation to
/// stop at its next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns `true` if `cancel()` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
