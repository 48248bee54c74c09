//! Progress reporting for single-file transfers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives `(bytes_transferred, total_bytes)` from the transferring task.
///
/// Called synchronously on the transfer path, so it must return quickly.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Forwards progress to an optional callback, never reporting a smaller
/// byte count than it already reported.
///
/// A retried transfer restarts from zero; the tracker keeps the high-water
/// mark so the callback still sees a non-decreasing sequence.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    callback: Option<ProgressCallback>,
    total: Arc<AtomicU64>,
    reported: Arc<AtomicU64>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("has_callback", &self.callback.is_some())
            .field("total", &self.total.load(Ordering::Relaxed))
            .field("reported", &self.reported.load(Ordering::Relaxed))
            .finish()
    }
}

impl ProgressTracker {
    #[must_use]
    pub fn new(callback: Option<ProgressCallback>, total: u64) -> Self {
        Self {
            callback,
            total: Arc::new(AtomicU64::new(total)),
            reported: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sets the total once it is known (e.g. from a response header).
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Reports `transferred` bytes for the current attempt.
    pub fn update(&self, transferred: u64) {
        let previous = self.reported.fetch_max(transferred, Ordering::Relaxed);
        if let Some(callback) = &self.callback {
            callback(previous.max(transferred), self.total().max(transferred));
        }
    }

    /// Reports completion: `transferred == total`.
    pub fn finish(&self) {
        let total = self.total().max(self.reported.load(Ordering::Relaxed));
        self.total.store(total, Ordering::Relaxed);
        self.update(total);
    }
}
