// tk-core/src/cancel.rs
// Cooperative cancellation token observed between replay / index operations

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, TkError};

/// Shared flag that long-running store operations poll between steps.
///
/// Cancellation never interrupts an in-flight write; it is only observed at
/// operation boundaries, so a cancelled replay leaves the WAL committed and
/// the next opener retries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Error out if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(TkError::Cancelled)
        } else {
            Ok(())
        }
    }
}
