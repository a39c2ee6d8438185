//! Mapping wall-clock time onto the bucket ring.

use std::fmt;

/// A bucket of the ring, tagged with the lap (`epoch`) it belongs to.
///
/// Ordering is by epoch then slot, which matches the order of the
/// underlying bucket ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bucket {
    /// Number of full laps of the ring since the unix epoch
    pub epoch: u64,
    /// Position within the ring, in `0..bucket_count`
    pub slot: u64,
}

impl Bucket {
    /// Hash field name holding this bucket's count.
    pub fn field(&self) -> String {
        self.to_string()
    }

    /// Parse a hash field name back into a bucket.
    pub fn parse(field: &str) -> Option<Self> {
        let (epoch, slot) = field.split_once(':')?;
        Some(Self {
            epoch: epoch.parse().ok()?,
            slot: slot.parse().ok()?,
        })
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.slot)
    }
}

/// Maps unix time to buckets of a fixed-size ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketIndexer {
    interval: u64,
    count: u64,
}

impl BucketIndexer {
    /// Create an indexer for `count` buckets of `interval` seconds each.
    ///
    /// Both values must be positive.
    pub fn new(interval: u64, count: u64) -> Self {
        Self { interval, count }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Absolute bucket number of `time`.
    pub fn ordinal_of(&self, time: u64) -> u64 {
        time / self.interval
    }

    /// Bucket holding `time`.
    pub fn bucket_of(&self, time: u64) -> Bucket {
        self.bucket_at(self.ordinal_of(time))
    }

    /// Bucket for an absolute bucket number.
    pub fn bucket_at(&self, ordinal: u64) -> Bucket {
        Bucket {
            epoch: ordinal / self.count,
            slot: ordinal % self.count,
        }
    }

    /// Absolute bucket number of `bucket`.
    pub fn ordinal(&self, bucket: Bucket) -> u64 {
        bucket.epoch * self.count + bucket.slot
    }

    /// Buckets strictly after `oldest` up to and including `current`,
    /// oldest first.
    pub fn range(&self, oldest: u64, current: u64) -> impl Iterator<Item = Bucket> + '_ {
        (oldest.saturating_add(1)..=current).map(move |ordinal| self.bucket_at(ordinal))
    }

    /// Buckets two laps back in the `ahead` ring slots after `current`.
    ///
    /// A read never reaches more than one lap back, so these are
    /// unreachable for as long as `ahead < count`.
    pub fn ahead(&self, current: u64, ahead: u64) -> Vec<Bucket> {
        (1..=ahead)
            .filter_map(|step| (current + step).checked_sub(2 * self.count))
            .map(|ordinal| self.bucket_at(ordinal))
            .collect()
    }
}
