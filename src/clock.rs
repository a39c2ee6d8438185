//! Time sources for bucket indexing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A source of wall-clock time in whole seconds since the unix epoch.
///
/// Every process sharing a counter must agree on this clock, since bucket
/// indices are derived from it.
pub trait Clock: Send + Sync {
    /// Current unix time in seconds.
    fn now_secs(&self) -> u64;
}

/// System wall clock.
///
/// Readings before the unix epoch are clamped to zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }
}

/// A manually driven clock shared between clones.
///
/// Useful in tests, where the limiter and a [`crate::store::MemoryStore`]
/// must observe the same simulated time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    secs: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at `secs`.
    pub fn new(secs: u64) -> Self {
        Self {
            secs: Arc::new(AtomicU64::new(secs)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, secs: u64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }
}
