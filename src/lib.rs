//! Windowed Ratelimit - sliding-window rate limiting over a shared store
//!
//! This crate counts events per subject in fixed-width time buckets kept in a
//! TTL-capable key-value store, sums the buckets covering a lookback interval
//! to approximate a sliding window, and gates work on thresholds. Any number
//! of processes pointed at the same store share one quota per subject.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LimiterConfig;
pub use error::{RatelimitError, Result};
pub use ratelimit::{ThresholdOptions, WindowedCounter};
pub use store::{CounterStore, MemoryStore};
