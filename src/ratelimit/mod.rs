//! Sliding-window counting and threshold decisions.

mod bucket;
mod counter;
mod gate;

pub use bucket::{Bucket, BucketIndexer};
pub use counter::WindowedCounter;
pub use gate::{BurstLimit, ThresholdOptions};
