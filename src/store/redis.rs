//! Redis-backed store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::ErrorKind;
use tracing::{debug, info};

use super::script::Script;
use super::{CounterStore, HashOp, StoreError, StoreResult};

/// A [`CounterStore`] over a Redis connection.
///
/// The connection manager is cloned per call; clones share one multiplexed
/// connection and reconnect transparently.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Wrap an existing connection.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Connect to the server at `url`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        info!(url = %url, "Connecting to Redis");
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn transaction(&self, key: &str, ops: &[HashOp]) -> StoreResult<Vec<i64>> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        // HDEL without fields is a syntax error, so empty deletes are
        // answered locally and spliced back into the reply list.
        let mut skipped = Vec::new();
        for (i, op) in ops.iter().enumerate() {
            match op {
                HashOp::IncrBy { field, by } => {
                    pipe.cmd("HINCRBY").arg(key).arg(field).arg(*by);
                }
                HashOp::Delete { fields } if fields.is_empty() => skipped.push(i),
                HashOp::Delete { fields } => {
                    pipe.cmd("HDEL").arg(key).arg(fields.as_slice());
                }
                HashOp::Expire { seconds } => {
                    pipe.cmd("EXPIRE").arg(key).arg(*seconds);
                }
            }
        }

        let mut conn = self.conn.clone();
        let mut replies: Vec<i64> = if skipped.len() == ops.len() {
            Vec::new()
        } else {
            pipe.query_async(&mut conn).await?
        };
        for i in skipped {
            replies.insert(i, 0);
        }

        if replies.len() != ops.len() {
            return Err(StoreError::Protocol(format!(
                "transaction returned {} replies for {} commands",
                replies.len(),
                ops.len()
            )));
        }
        Ok(replies)
    }

    async fn get_fields(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<i64>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<i64>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn field_names(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let names: Vec<String> = redis::cmd("HKEYS").arg(key).query_async(&mut conn).await?;
        Ok(names)
    }

    async fn delete_fields(&self, key: &str, fields: &[String]) -> StoreResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("HDEL")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn script_load(&self, script: &Script) -> StoreResult<String> {
        let mut conn = self.conn.clone();
        let digest: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script.source)
            .query_async(&mut conn)
            .await?;
        debug!(script = script.name, digest = %digest, "Loaded script");
        Ok(digest)
    }

    async fn eval_script(&self, digest: &str, keys: &[String], args: &[String]) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = redis::cmd("EVALSHA")
            .arg(digest)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                Err(StoreError::NoScript(digest.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
