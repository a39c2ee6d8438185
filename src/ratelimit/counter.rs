//! Windowed counter: writes, sliding reads and bucket maintenance.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace, warn};

use super::bucket::{Bucket, BucketIndexer};
use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::error::Result;
use crate::store::{CounterStore, HashOp, StoreError, ADMIT};

/// Ring slots ahead of the current bucket whose stale entries are cleared on
/// every write. Must stay below the minimum bucket count.
pub(crate) const EVICT_AHEAD: u64 = 2;

/// A sliding-window event counter shared through a key-value store.
///
/// Each subject gets one hash in the store, keyed `"{key_prefix}:{subject}"`,
/// mapping bucket fields to event counts. The counter itself only holds
/// immutable configuration, so it can be shared freely across tasks and any
/// number of processes can point at the same store.
pub struct WindowedCounter {
    config: LimiterConfig,
    indexer: BucketIndexer,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    /// Digest of the admit script, as the store is expected to know it.
    pub(crate) admit_digest: String,
}

impl std::fmt::Debug for WindowedCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowedCounter")
            .field("config", &self.config)
            .field("indexer", &self.indexer)
            .finish()
    }
}

impl WindowedCounter {
    /// Create a counter driven by the system clock.
    pub fn new(config: LimiterConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a counter driven by the given clock.
    pub fn with_clock(
        config: LimiterConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let indexer = BucketIndexer::new(config.bucket_interval, config.bucket_count());

        debug!(
            key_prefix = %config.key_prefix,
            bucket_span = config.bucket_span,
            bucket_interval = config.bucket_interval,
            bucket_expiry = config.bucket_expiry(),
            "Creating windowed counter"
        );

        Ok(Self {
            config,
            indexer,
            store,
            clock,
            admit_digest: ADMIT.digest(),
        })
    }

    /// Get the configuration of this counter.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Get the bucket indexer of this counter.
    pub fn indexer(&self) -> &BucketIndexer {
        &self.indexer
    }

    /// Store key holding the counts for `subject`.
    pub fn key<S: Display + ?Sized>(&self, subject: &S) -> String {
        format!("{}:{}", self.config.key_prefix, subject)
    }

    /// Bucket holding the current time.
    pub fn current_bucket(&self) -> Bucket {
        self.indexer.bucket_of(self.clock.now_secs())
    }

    /// Add `amount` events for `subject` to the current bucket.
    ///
    /// Returns the new value of the current bucket, not the windowed total.
    pub async fn add<S: Display + ?Sized>(&self, subject: &S, amount: i64) -> Result<i64> {
        let key = self.key(subject);
        let current = self.indexer.ordinal_of(self.clock.now_secs());
        let field = self.indexer.bucket_at(current).field();

        let mut ops = vec![HashOp::IncrBy {
            field: field.clone(),
            by: amount,
        }];
        let evict = self.evict_fields(current);
        if !evict.is_empty() {
            ops.push(HashOp::Delete { fields: evict });
        }
        ops.push(HashOp::Expire {
            seconds: self.key_ttl(),
        });

        let replies = self.store.transaction(&key, &ops).await?;
        let value = replies
            .first()
            .copied()
            .ok_or_else(|| StoreError::Protocol("empty transaction reply".into()))?;

        trace!(key = %key, bucket = %field, amount = amount, value = value, "Added events");

        self.maybe_sweep(&key).await;
        Ok(value)
    }

    /// Sum the events recorded for `subject` over the last `interval` seconds.
    ///
    /// The interval is clamped to `[bucket_interval, bucket_span]`.
    pub async fn count<S: Display + ?Sized>(&self, subject: &S, interval: u64) -> Result<u64> {
        let key = self.key(subject);
        let fields = self.window_fields(self.clock.now_secs(), interval);

        let values = self.store.get_fields(&key, &fields).await?;
        let total: i64 = values.into_iter().flatten().sum();

        trace!(key = %key, interval = interval, buckets = fields.len(), total = total, "Counted events");
        Ok(total.max(0) as u64)
    }

    /// Delete buckets of `subject` older than `bucket_expiry`.
    ///
    /// Returns the number of removed buckets.
    pub async fn sweep<S: Display + ?Sized>(&self, subject: &S) -> Result<u64> {
        self.sweep_key(&self.key(subject)).await
    }

    async fn sweep_key(&self, key: &str) -> Result<u64> {
        let now = self.clock.now_secs();
        let oldest_allowed = self
            .indexer
            .bucket_of(now.saturating_sub(self.config.bucket_expiry()));

        let stale: Vec<String> = self
            .store
            .field_names(key)
            .await?
            .into_iter()
            .filter(|field| Bucket::parse(field).is_some_and(|b| b < oldest_allowed))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let removed = self.store.delete_fields(key, &stale).await?;
        debug!(key = %key, oldest_allowed = %oldest_allowed, removed = removed, "Swept stale buckets");
        Ok(removed)
    }

    /// Sweep `key` with probability `sweep_probability`.
    ///
    /// Runs after a committed write, so failures are logged and dropped.
    pub(crate) async fn maybe_sweep(&self, key: &str) {
        if !self.roll_sweep() {
            return;
        }
        if let Err(e) = self.sweep_key(key).await {
            warn!(key = %key, error = %e, "Failed to sweep stale buckets");
        }
    }

    fn roll_sweep(&self) -> bool {
        let probability = self.config.sweep_probability;
        probability > 0.0 && rand::thread_rng().gen_bool(probability)
    }

    /// Fields covering `interval` seconds back from `now`, oldest first.
    pub(crate) fn window_fields(&self, now: u64, interval: u64) -> Vec<String> {
        let interval = interval.clamp(self.config.bucket_interval, self.config.bucket_span);
        let current = self.indexer.ordinal_of(now);
        let oldest = self.indexer.ordinal_of(now.saturating_sub(interval));

        self.indexer.range(oldest, current).map(|b| b.field()).collect()
    }

    /// Unreachable fields in the ring slots about to be reused.
    pub(crate) fn evict_fields(&self, current: u64) -> Vec<String> {
        self.indexer
            .ahead(current, EVICT_AHEAD)
            .into_iter()
            .map(|b| b.field())
            .collect()
    }

    /// Idle expiry of a counter key. The extra interval keeps a key alive
    /// while its newest bucket is still being written.
    pub(crate) fn key_ttl(&self) -> u64 {
        self.config.bucket_expiry() + self.config.bucket_interval
    }

    /// Pause between polls of the blocking gate operations.
    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.bucket_interval)
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_secs()
    }

    pub(crate) fn store(&self) -> &dyn CounterStore {
        self.store.as_ref()
    }
}
