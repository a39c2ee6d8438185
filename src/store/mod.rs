//! The key-value store seam.
//!
//! Counters live entirely in an external store that offers a hash per key,
//! atomic multi-command transactions, server-side scripts and per-key
//! expiration. [`CounterStore`] captures exactly that surface so that any
//! compliant store can back a counter.

use async_trait::async_trait;
use thiserror::Error;

mod memory;
#[cfg(feature = "redis")]
mod redis;
mod script;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
pub use script::{AdmitArgs, Script, ADMIT};

/// Errors that can occur talking to the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store does not hold a script with this digest.
    #[error("Script not loaded: {0}")]
    NoScript(String),
    /// The store cannot execute this script.
    #[error("Unsupported script: {0}")]
    UnsupportedScript(String),
    /// The store rejected a command or returned something unexpected.
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A single command inside a [`CounterStore::transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOp {
    /// Increment a field, creating the hash and field if absent.
    IncrBy { field: String, by: i64 },
    /// Delete fields.
    Delete { fields: Vec<String> },
    /// Expire the whole key after this many seconds.
    Expire { seconds: u64 },
}

/// Operations a store must offer to back a windowed counter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Apply `ops` to the hash at `key` atomically, returning one integer
    /// reply per op: the new value for `IncrBy`, the number of removed
    /// fields for `Delete`, and 1 or 0 for `Expire`.
    async fn transaction(&self, key: &str, ops: &[HashOp]) -> StoreResult<Vec<i64>>;

    /// Read several fields in one round trip. Missing fields are `None`.
    async fn get_fields(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<i64>>>;

    /// List the field names of the hash at `key`.
    async fn field_names(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Delete fields, returning how many existed.
    async fn delete_fields(&self, key: &str, fields: &[String]) -> StoreResult<u64>;

    /// Register a script and return its digest.
    async fn script_load(&self, script: &Script) -> StoreResult<String>;

    /// Run a registered script by digest.
    ///
    /// Fails with [`StoreError::NoScript`] when the store has evicted it.
    async fn eval_script(&self, digest: &str, keys: &[String], args: &[String]) -> StoreResult<i64>;
}
