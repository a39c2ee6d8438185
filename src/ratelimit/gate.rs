//! Threshold decisions on top of a windowed counter.
//!
//! [`WindowedCounter::await_and_run`] checks and acts in separate steps, so
//! concurrent callers can all pass the check and jointly overshoot the
//! threshold. [`WindowedCounter::await_admit_and_run`] closes that race by
//! checking and counting inside a single store-side script.

use std::fmt::Display;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::counter::WindowedCounter;
use crate::error::Result;
use crate::store::{AdmitArgs, StoreError, ADMIT};

/// A shorter window admitting events on its own threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurstLimit {
    /// Lookback of the burst window, in seconds
    pub interval: u64,
    /// Events allowed within the burst window
    pub threshold: u64,
}

/// Per-call options for the threshold operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdOptions {
    /// Lookback window, in seconds
    pub interval: u64,
    /// Events allowed within the window
    pub threshold: u64,
    /// Events counted per admission
    #[serde(default = "default_increment")]
    pub increment: i64,
    /// Optional burst window, admitting even when the main window is full
    #[serde(default)]
    pub burst: Option<BurstLimit>,
}

fn default_increment() -> i64 {
    1
}

impl ThresholdOptions {
    /// Allow `threshold` events per `interval` seconds.
    pub fn new(interval: u64, threshold: u64) -> Self {
        Self {
            interval,
            threshold,
            increment: default_increment(),
            burst: None,
        }
    }

    /// Count `increment` events per admission.
    pub fn with_increment(mut self, increment: i64) -> Self {
        self.increment = increment;
        self
    }

    /// Also admit while fewer than `threshold` events fall within the
    /// last `interval` seconds.
    pub fn with_burst(mut self, interval: u64, threshold: u64) -> Self {
        self.burst = Some(BurstLimit {
            interval,
            threshold,
        });
        self
    }
}

impl WindowedCounter {
    /// Whether `subject` has reached the threshold within the interval.
    pub async fn exceeded<S: Display + ?Sized>(
        &self,
        subject: &S,
        options: &ThresholdOptions,
    ) -> Result<bool> {
        Ok(self.count(subject, options.interval).await? >= options.threshold)
    }

    /// Whether `subject` is still below the threshold within the interval.
    pub async fn within_bounds<S: Display + ?Sized>(
        &self,
        subject: &S,
        options: &ThresholdOptions,
    ) -> Result<bool> {
        Ok(!self.exceeded(subject, options).await?)
    }

    /// Wait until `subject` is within bounds, then run `action`.
    ///
    /// Polls every `bucket_interval` seconds and never times out. The
    /// check does not count anything; callers record their own events.
    pub async fn await_and_run<S, F, Fut, T>(
        &self,
        subject: &S,
        options: &ThresholdOptions,
        action: F,
    ) -> Result<T>
    where
        S: Display + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        while self.exceeded(subject, options).await? {
            debug!(
                key = %self.key(subject),
                threshold = options.threshold,
                interval = options.interval,
                "Threshold exceeded, waiting"
            );
            tokio::time::sleep(self.poll_interval()).await;
        }
        Ok(action().await)
    }

    /// Try once to admit an event for `subject`.
    ///
    /// Admission and the increment happen atomically in the store; the
    /// counter is left untouched on rejection.
    pub async fn admit<S: Display + ?Sized>(
        &self,
        subject: &S,
        options: &ThresholdOptions,
    ) -> Result<bool> {
        let key = self.key(subject);
        let now = self.now();
        let current = self.indexer().ordinal_of(now);

        let args = AdmitArgs {
            threshold: options.threshold,
            burst_threshold: options.burst.map(|b| b.threshold).unwrap_or(0),
            increment: options.increment,
            ttl: self.key_ttl(),
            current: self.indexer().bucket_at(current).field(),
            window: self.window_fields(now, options.interval),
            burst: options
                .burst
                .map(|b| self.window_fields(now, b.interval))
                .unwrap_or_default(),
            evict: self.evict_fields(current),
        };

        let admitted = self.eval_admit(&key, &args.encode()).await? == 1;
        trace!(key = %key, admitted = admitted, "Admission attempt");

        if admitted {
            self.maybe_sweep(&key).await;
        }
        Ok(admitted)
    }

    /// Wait until an event for `subject` is admitted, then run `action`.
    ///
    /// Polls every `bucket_interval` seconds and never times out; wrap the
    /// call in `tokio::time::timeout` to bound the wait.
    pub async fn await_admit_and_run<S, F, Fut, T>(
        &self,
        subject: &S,
        options: &ThresholdOptions,
        action: F,
    ) -> Result<T>
    where
        S: Display + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        while !self.admit(subject, options).await? {
            debug!(
                key = %self.key(subject),
                threshold = options.threshold,
                interval = options.interval,
                "Admission rejected, waiting"
            );
            tokio::time::sleep(self.poll_interval()).await;
        }
        Ok(action().await)
    }

    /// Run the admit script, loading it once if the store lost it.
    async fn eval_admit(&self, key: &str, args: &[String]) -> Result<i64> {
        let keys = [key.to_string()];
        match self.store().eval_script(&self.admit_digest, &keys, args).await {
            Err(StoreError::NoScript(_)) => {
                debug!(digest = %self.admit_digest, "Admit script not loaded, registering it");
                let digest = self.store().script_load(&ADMIT).await?;
                Ok(self.store().eval_script(&digest, &keys, args).await?)
            }
            result => Ok(result?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::clock::{Clock, ManualClock};
    use crate::config::LimiterConfig;
    use crate::error::RatelimitError;
    use crate::store::{CounterStore, HashOp, MemoryStore, Script, StoreResult};

    const START: u64 = 1_700_000_000;

    /// Unix time that follows tokio's (possibly paused) clock.
    struct TokioClock {
        base: u64,
        started: tokio::time::Instant,
    }

    impl TokioClock {
        fn new(base: u64) -> Self {
            Self {
                base,
                started: tokio::time::Instant::now(),
            }
        }
    }

    impl Clock for TokioClock {
        fn now_secs(&self) -> u64 {
            self.base + self.started.elapsed().as_secs()
        }
    }

    fn config() -> LimiterConfig {
        LimiterConfig::new("key")
            .with_buckets(60, 5)
            .with_sweep_probability(0.0)
    }

    fn counter() -> (WindowedCounter, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(START);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let counter = WindowedCounter::with_clock(
            LimiterConfig::new("key").with_sweep_probability(0.0),
            store.clone(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (counter, store, clock)
    }

    fn paused_counter() -> Arc<WindowedCounter> {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new(START));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        Arc::new(WindowedCounter::with_clock(config(), store, clock).unwrap())
    }

    #[tokio::test]
    async fn test_exceeded_and_within_bounds() {
        let (counter, _, _) = counter();
        let options = ThresholdOptions::new(30, 10);

        for _ in 0..5 {
            counter.add("value1", 1).await.unwrap();
        }
        assert!(!counter.exceeded("value1", &options).await.unwrap());
        assert!(counter.within_bounds("value1", &options).await.unwrap());

        for _ in 0..10 {
            counter.add("value1", 1).await.unwrap();
        }
        assert!(counter.exceeded("value1", &options).await.unwrap());
        assert!(!counter.within_bounds("value1", &options).await.unwrap());
    }

    #[tokio::test]
    async fn test_exceeded_at_threshold() {
        let (counter, _, _) = counter();
        let options = ThresholdOptions::new(30, 3);

        counter.add("s", 2).await.unwrap();
        assert!(!counter.exceeded("s", &options).await.unwrap());

        counter.add("s", 1).await.unwrap();
        assert_eq!(counter.count("s", 30).await.unwrap(), 3);
        assert!(counter.exceeded("s", &options).await.unwrap());
    }

    #[tokio::test]
    async fn test_admit_counts_only_admitted_events() {
        let (counter, _, _) = counter();
        let options = ThresholdOptions::new(30, 3);

        for _ in 0..3 {
            assert!(counter.admit("s", &options).await.unwrap());
        }
        assert!(!counter.admit("s", &options).await.unwrap());
        assert_eq!(counter.count("s", 30).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_admit_with_increment() {
        let (counter, store, _) = counter();
        let options = ThresholdOptions::new(30, 5).with_increment(2);

        assert!(counter.admit("s", &options).await.unwrap());
        assert!(counter.admit("s", &options).await.unwrap());
        assert!(counter.admit("s", &options).await.unwrap());
        assert!(!counter.admit("s", &options).await.unwrap());

        assert_eq!(counter.count("s", 30).await.unwrap(), 6);
        assert_eq!(store.ttl("key:s"), Some(605));
    }

    #[tokio::test]
    async fn test_admit_burst_window() {
        let (counter, _, clock) = counter();
        let options = ThresholdOptions::new(60, 2).with_burst(5, 1);

        assert!(counter.admit("s", &options).await.unwrap());
        clock.advance(5);
        assert!(counter.admit("s", &options).await.unwrap());

        // Main window is full, but the current bucket is still empty.
        clock.advance(5);
        assert!(counter.admit("s", &options).await.unwrap());
        assert!(!counter.admit("s", &options).await.unwrap());

        assert_eq!(counter.count("s", 60).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_admit_holds_threshold_with_three_buckets() {
        let clock = ManualClock::new(START);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let config = LimiterConfig::new("key")
            .with_buckets(15, 5)
            .with_sweep_probability(0.0);
        let counter = WindowedCounter::with_clock(config, store, Arc::new(clock.clone())).unwrap();
        let options = ThresholdOptions::new(15, 5);

        let mut admitted = 0;
        for _ in 0..4 {
            admitted += counter.admit("s", &options).await.unwrap() as u64;
        }
        clock.advance(5);
        for _ in 0..10 {
            admitted += counter.admit("s", &options).await.unwrap() as u64;
        }

        assert_eq!(admitted, 5);
        assert_eq!(counter.count("s", 15).await.unwrap(), 5);
    }

    /// A store that cannot list hash fields, so every sweep fails.
    #[derive(Default)]
    struct UnsweepableStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl CounterStore for UnsweepableStore {
        async fn transaction(&self, key: &str, ops: &[HashOp]) -> StoreResult<Vec<i64>> {
            self.inner.transaction(key, ops).await
        }

        async fn get_fields(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<i64>>> {
            self.inner.get_fields(key, fields).await
        }

        async fn field_names(&self, _: &str) -> StoreResult<Vec<String>> {
            Err(StoreError::Protocol("connection reset".into()))
        }

        async fn delete_fields(&self, key: &str, fields: &[String]) -> StoreResult<u64> {
            self.inner.delete_fields(key, fields).await
        }

        async fn script_load(&self, script: &Script) -> StoreResult<String> {
            self.inner.script_load(script).await
        }

        async fn eval_script(&self, digest: &str, keys: &[String], args: &[String]) -> StoreResult<i64> {
            self.inner.eval_script(digest, keys, args).await
        }
    }

    #[tokio::test]
    async fn test_failed_sweep_keeps_committed_writes() {
        let config = config().with_sweep_probability(1.0);
        let counter = WindowedCounter::new(config, Arc::new(UnsweepableStore::default())).unwrap();
        let options = ThresholdOptions::new(30, 5);

        assert_eq!(counter.add("s", 1).await.unwrap(), 1);
        assert!(counter.admit("s", &options).await.unwrap());

        let ran = AtomicUsize::new(0);
        counter
            .await_admit_and_run("s", &options, || async {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(counter.count("s", 30).await.unwrap(), 3);

        // An explicit sweep still reports the failure.
        assert!(matches!(
            counter.sweep("s").await,
            Err(RatelimitError::Store(StoreError::Protocol(_)))
        ));
    }

    #[tokio::test]
    async fn test_admit_reloads_evicted_script() {
        let (counter, store, _) = counter();
        let options = ThresholdOptions::new(30, 2);

        assert!(counter.admit("s", &options).await.unwrap());
        store.flush_scripts();
        assert!(counter.admit("s", &options).await.unwrap());
        assert!(!counter.admit("s", &options).await.unwrap());
    }

    /// A store that never keeps scripts and records every call.
    #[derive(Default)]
    struct ForgetfulStore {
        inner: MemoryStore,
        loads: AtomicUsize,
        evals: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for ForgetfulStore {
        async fn transaction(&self, key: &str, ops: &[HashOp]) -> StoreResult<Vec<i64>> {
            self.inner.transaction(key, ops).await
        }

        async fn get_fields(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<i64>>> {
            self.inner.get_fields(key, fields).await
        }

        async fn field_names(&self, key: &str) -> StoreResult<Vec<String>> {
            self.inner.field_names(key).await
        }

        async fn delete_fields(&self, key: &str, fields: &[String]) -> StoreResult<u64> {
            self.inner.delete_fields(key, fields).await
        }

        async fn script_load(&self, script: &Script) -> StoreResult<String> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(script.digest())
        }

        async fn eval_script(&self, digest: &str, _: &[String], _: &[String]) -> StoreResult<i64> {
            self.evals.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NoScript(digest.to_string()))
        }
    }

    #[tokio::test]
    async fn test_admit_retries_script_only_once() {
        let store = Arc::new(ForgetfulStore::default());
        let counter = WindowedCounter::new(config(), store.clone()).unwrap();

        let result = counter.admit("s", &ThresholdOptions::new(30, 1)).await;

        assert!(matches!(
            result,
            Err(RatelimitError::Store(StoreError::NoScript(_)))
        ));
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
        assert_eq!(store.evals.load(Ordering::SeqCst), 2);
    }

    /// A store whose reads always fail.
    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn transaction(&self, _: &str, _: &[HashOp]) -> StoreResult<Vec<i64>> {
            Err(StoreError::Protocol("connection reset".into()))
        }

        async fn get_fields(&self, _: &str, _: &[String]) -> StoreResult<Vec<Option<i64>>> {
            Err(StoreError::Protocol("connection reset".into()))
        }

        async fn field_names(&self, _: &str) -> StoreResult<Vec<String>> {
            Err(StoreError::Protocol("connection reset".into()))
        }

        async fn delete_fields(&self, _: &str, _: &[String]) -> StoreResult<u64> {
            Err(StoreError::Protocol("connection reset".into()))
        }

        async fn script_load(&self, _: &Script) -> StoreResult<String> {
            Err(StoreError::Protocol("connection reset".into()))
        }

        async fn eval_script(&self, _: &str, _: &[String], _: &[String]) -> StoreResult<i64> {
            Err(StoreError::Protocol("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let counter = WindowedCounter::new(config(), Arc::new(BrokenStore)).unwrap();
        let options = ThresholdOptions::new(30, 1);

        assert!(matches!(
            counter.add("s", 1).await,
            Err(RatelimitError::Store(StoreError::Protocol(_)))
        ));
        assert!(counter.exceeded("s", &options).await.is_err());
        assert!(matches!(
            counter.admit("s", &options).await,
            Err(RatelimitError::Store(StoreError::Protocol(_)))
        ));
        let result = counter.await_and_run("s", &options, || async { 1 }).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_and_run_waits_for_window() {
        let counter = paused_counter();
        let options = ThresholdOptions::new(10, 3);
        for _ in 0..3 {
            counter.add("s", 1).await.unwrap();
        }

        let started = tokio::time::Instant::now();
        let value = counter.await_and_run("s", &options, || async { 7 }).await.unwrap();

        assert_eq!(value, 7);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(15), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_and_run_runs_immediately_within_bounds() {
        let counter = paused_counter();
        let started = tokio::time::Instant::now();

        let value = counter
            .await_and_run("s", &ThresholdOptions::new(10, 3), || async { "ran" })
            .await
            .unwrap();

        assert_eq!(value, "ran");
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_and_run_blocks_while_exceeded() {
        let counter = paused_counter();
        let options = ThresholdOptions::new(30, 30);
        counter.add("key", 31).await.unwrap();
        assert_eq!(counter.count("key", 30).await.unwrap(), 31);

        let ran = AtomicUsize::new(0);
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            counter.await_and_run("key", &options, || async {
                ran.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(40)).await;
        counter
            .await_and_run("key", &options, || async {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_admit_and_run_never_overshoots() {
        let counter = paused_counter();
        let options = ThresholdOptions::new(60, 5);
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let counter = counter.clone();
                let admitted = admitted.clone();
                tokio::spawn(async move {
                    counter
                        .await_admit_and_run("shared", &options, || async move {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        })
                        .await
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 5);
        assert_eq!(counter.count("shared", 60).await.unwrap(), 5);

        // Once the first bucket leaves the window, exactly one more batch fits.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 10);
        assert_eq!(counter.count("shared", 60).await.unwrap(), 5);

        for handle in &handles {
            handle.abort();
        }
        let finished = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(()))))
            .count();
        assert_eq!(finished, 10);
    }
}
