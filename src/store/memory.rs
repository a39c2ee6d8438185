//! In-process store.
//!
//! Holds each counter key as a hash guarded by its `DashMap` shard, so every
//! operation on a single key is atomic. Expiry is evaluated lazily against
//! the injected clock. Scripts shipped with this crate are executed natively.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use super::script::{AdmitArgs, Script, ADMIT};
use super::{CounterStore, HashOp, StoreError, StoreResult};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Default)]
struct HashEntry {
    fields: HashMap<String, i64>,
    /// Unix second at which the key disappears.
    expires_at: Option<u64>,
}

impl HashEntry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn incr(&mut self, field: &str, by: i64) -> i64 {
        let value = self.fields.entry(field.to_string()).or_insert(0);
        *value += by;
        *value
    }

    fn delete(&mut self, fields: &[String]) -> u64 {
        fields
            .iter()
            .filter(|f| self.fields.remove(f.as_str()).is_some())
            .count() as u64
    }

    /// Whether the summed `fields` stay strictly below `limit`.
    fn below(&self, fields: &[String], limit: u64) -> bool {
        let sum: i128 = fields
            .iter()
            .filter_map(|f| self.fields.get(f))
            .map(|&v| i128::from(v))
            .sum();
        sum < i128::from(limit)
    }
}

/// Scripts this store knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NativeScript {
    Admit,
}

/// A [`CounterStore`] living in process memory.
pub struct MemoryStore {
    entries: DashMap<String, HashEntry>,
    scripts: RwLock<HashMap<String, NativeScript>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.entries.len())
            .field("scripts", &self.scripts.read().len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store expiring keys by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store expiring keys by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            scripts: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Forget every loaded script, as a store restart or `SCRIPT FLUSH` would.
    pub fn flush_scripts(&self) {
        self.scripts.write().clear();
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_secs();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Seconds until `key` expires, if it exists and has an expiry.
    pub fn ttl(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_secs();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.expires_at.map(|at| at - now)
    }

    /// Run `f` against the live hash at `key`, creating it if needed, then
    /// drop the key if it ended up empty.
    fn with_entry<T>(&self, key: &str, f: impl FnOnce(&mut HashEntry, u64) -> T) -> T {
        let now = self.clock.now_secs();
        let result = {
            let mut entry = self.entries.entry(key.to_string()).or_default();
            if entry.is_expired(now) {
                *entry = HashEntry::default();
            }
            f(&mut *entry, now)
        };
        self.entries.remove_if(key, |_, e| e.fields.is_empty());
        result
    }

    fn read_entry<T>(&self, key: &str, f: impl FnOnce(Option<&HashEntry>) -> T) -> T {
        let now = self.clock.now_secs();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => f(Some(&*entry)),
            _ => f(None),
        }
    }

    fn admit(&self, key: &str, args: AdmitArgs) -> i64 {
        self.with_entry(key, |entry, now| {
            let burst_open = !args.burst.is_empty() && entry.below(&args.burst, args.burst_threshold);
            let admitted = burst_open || entry.below(&args.window, args.threshold);
            if !admitted {
                return 0;
            }

            entry.incr(&args.current, args.increment);
            entry.delete(&args.evict);
            entry.expires_at = Some(now.saturating_add(args.ttl));
            1
        })
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn transaction(&self, key: &str, ops: &[HashOp]) -> StoreResult<Vec<i64>> {
        trace!(key = %key, ops = ops.len(), "Applying transaction");

        Ok(self.with_entry(key, |entry, now| {
            ops.iter()
                .map(|op| match op {
                    HashOp::IncrBy { field, by } => entry.incr(field, *by),
                    HashOp::Delete { fields } => entry.delete(fields) as i64,
                    HashOp::Expire { seconds } => {
                        if entry.fields.is_empty() {
                            0
                        } else {
                            entry.expires_at = Some(now.saturating_add(*seconds));
                            1
                        }
                    }
                })
                .collect()
        }))
    }

    async fn get_fields(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<i64>>> {
        Ok(self.read_entry(key, |entry| {
            fields
                .iter()
                .map(|f| entry.and_then(|e| e.fields.get(f).copied()))
                .collect()
        }))
    }

    async fn field_names(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self.read_entry(key, |entry| {
            entry
                .map(|e| e.fields.keys().cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn delete_fields(&self, key: &str, fields: &[String]) -> StoreResult<u64> {
        Ok(self.with_entry(key, |entry, _| entry.delete(fields)))
    }

    async fn script_load(&self, script: &Script) -> StoreResult<String> {
        let native = match script.name {
            name if name == ADMIT.name && script.source == ADMIT.source => NativeScript::Admit,
            name => return Err(StoreError::UnsupportedScript(name.to_string())),
        };
        let digest = script.digest();
        self.scripts.write().insert(digest.clone(), native);
        Ok(digest)
    }

    async fn eval_script(&self, digest: &str, keys: &[String], args: &[String]) -> StoreResult<i64> {
        let native = self
            .scripts
            .read()
            .get(digest)
            .copied()
            .ok_or_else(|| StoreError::NoScript(digest.to_string()))?;
        let key = keys
            .first()
            .ok_or_else(|| StoreError::Protocol("script called without a key".into()))?;

        match native {
            NativeScript::Admit => Ok(self.admit(key, AdmitArgs::decode(args)?)),
        }
    }
}
