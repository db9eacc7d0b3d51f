//! Typed facade over the shared key-value store.
//!
//! All persistent gateway state lives behind the [`KvStore`] trait:
//! credential records, rate windows, the request log, access tokens, and
//! admin config overrides. Production uses [`RedisStore`] (pooled
//! connections, pipelined batches); tests and single-process dev use
//! [`MemoryStore`].
//!
//! Payloads are UTF-8 JSON strings; the callers own (de)serialization so
//! the store stays schema-free.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use thiserror::Error;
use tokio::sync::Mutex;

/// Upper bound on pooled Redis connections.
const MAX_POOL_SIZE: usize = 20;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    fn from_redis(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// One operation inside an atomic write batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    HashSet {
        key: String,
        field: String,
        value: String,
    },
    HashIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    Expire {
        key: String,
        seconds: i64,
    },
}

/// The shared store contract. Multi-field updates of one entity must go
/// through [`KvStore::batch`], which backends submit as a single atomic
/// pipeline.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    /// Returns true if the field existed.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError>;
    async fn hash_len(&self, key: &str) -> Result<usize, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn set_members(&self, key: &str) -> Result<HashSet<String>, StoreError>;
    async fn set_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Append to a score-ordered log.
    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError>;
    /// Members by rank, highest score first. `start`/`stop` follow the
    /// Redis ZREVRANGE convention (inclusive, negative from the end).
    async fn sorted_rev_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError>;
    /// Remove all members with score <= `max_score`. Returns count removed.
    async fn sorted_remove_below(&self, key: &str, max_score: f64) -> Result<usize, StoreError>;

    /// All top-level keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Submit `ops` as one atomic pipeline.
    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> bool;

    /// Release backend resources. Dropping the store also suffices.
    fn close(&self) {}
}

pub type SharedStore = Arc<dyn KvStore>;

// ─────────────────────────────────────────────────────────────────────────────
// Redis backend
// ─────────────────────────────────────────────────────────────────────────────

/// Redis-backed store over a deadpool connection pool.
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    /// Create the pool and verify the backend is reachable with one ping.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let cfg = PoolConfig::from_url(url);
        let pool = cfg
            .builder()
            .map_err(|e| StoreError::Unavailable(format!("failed to build pool: {e}")))?
            .max_size(MAX_POOL_SIZE)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to create pool: {e}")))?;

        let store = Self { pool };
        {
            let mut conn = store.conn().await?;
            redis::cmd("PING")
                .query_async::<()>(&mut conn)
                .await
                .map_err(StoreError::from_redis)?;
        }
        tracing::info!(max_connections = MAX_POOL_SIZE, "store connection pool created");
        Ok(store)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.hget(key, field).await.map_err(StoreError::from_redis)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.hgetall(key).await.map_err(StoreError::from_redis)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(StoreError::from_redis)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.hdel(key, field).await.map_err(StoreError::from_redis)?;
        Ok(removed > 0)
    }

    async fn hash_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        conn.hlen(key).await.map_err(StoreError::from_redis)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.sadd::<_, _, ()>(key, member)
            .await
            .map_err(StoreError::from_redis)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.srem::<_, _, ()>(key, member)
            .await
            .map_err(StoreError::from_redis)
    }

    async fn set_members(&self, key: &str) -> Result<HashSet<String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.smembers(key).await.map_err(StoreError::from_redis)
    }

    async fn set_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        conn.scard(key).await.map_err(StoreError::from_redis)
    }

    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(StoreError::from_redis)
    }

    async fn sorted_rev_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.zrevrange(key, start, stop)
            .await
            .map_err(StoreError::from_redis)
    }

    async fn sorted_remove_below(&self, key: &str, max_score: f64) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        conn.zrembyscore(key, "-inf", max_score)
            .await
            .map_err(StoreError::from_redis)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, chunk): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(StoreError::from_redis)?;
            keys.extend(chunk);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                BatchOp::HashSet { key, field, value } => {
                    pipe.hset(key, field, value).ignore();
                }
                BatchOp::HashIncrBy { key, field, delta } => {
                    pipe.hincr(key, field, *delta).ignore();
                }
                BatchOp::Expire { key, seconds } => {
                    pipe.expire(key, *seconds).ignore();
                }
            }
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(StoreError::from_redis)
    }

    async fn ping(&self) -> bool {
        match self.conn().await {
            Ok(mut conn) => redis::cmd("PING").query_async::<()>(&mut conn).await.is_ok(),
            Err(_) => false,
        }
    }

    fn close(&self) {
        self.pool.close();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory backend
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory store with the same contract as [`RedisStore`].
///
/// Backs unit tests and single-process dev runs. Expiry is a Redis
/// concern; this backend records but never applies TTLs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    // Kept ordered by (score, member) so range queries are a slice walk.
    sorted: HashMap<String, Vec<(f64, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .hashes
            .get_mut(key)
            .map(|h| h.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn hash_len(&self, key: &str) -> Result<usize, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.hashes.get(key).map(|h| h.len()).unwrap_or(0))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<HashSet<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.sets.get(key).cloned().unwrap_or_default())
    }

    async fn set_len(&self, key: &str) -> Result<usize, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.sets.get(key).map(|s| s.len()).unwrap_or(0))
    }

    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let entries = inner.sorted.entry(key.to_string()).or_default();
        entries.push((score, member.to_string()));
        entries.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(())
    }

    async fn sorted_rev_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        let Some(entries) = inner.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let len = entries.len() as isize;
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len - 1)
            }
        };
        if len == 0 || start >= len {
            return Ok(Vec::new());
        }
        let (start, stop) = (norm(start), norm(stop));
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(entries
            .iter()
            .rev()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn sorted_remove_below(&self, key: &str, max_score: f64) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(entries) = inner.sorted.get_mut(key) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|(score, _)| *score > max_score);
        Ok(before - entries.len())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<String> = inner
            .hashes
            .keys()
            .chain(inner.sets.keys())
            .chain(inner.sorted.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        // The whole batch applies under one lock, matching the pipeline
        // atomicity of the Redis backend.
        let mut inner = self.inner.lock().await;
        for op in ops {
            match op {
                BatchOp::HashSet { key, field, value } => {
                    inner.hashes.entry(key).or_default().insert(field, value);
                }
                BatchOp::HashIncrBy { key, field, delta } => {
                    let entry = inner
                        .hashes
                        .entry(key)
                        .or_default()
                        .entry(field)
                        .or_insert_with(|| "0".to_string());
                    let current: i64 = entry.parse().unwrap_or(0);
                    *entry = (current + delta).to_string();
                }
                BatchOp::Expire { .. } => {}
            }
        }
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_roundtrip() {
        let store = MemoryStore::new();
        store.hash_set("h", "a", "1").await.unwrap();
        store.hash_set("h", "b", "2").await.unwrap();

        assert_eq!(store.hash_get("h", "a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.hash_get("h", "missing").await.unwrap(), None);
        assert_eq!(store.hash_len("h").await.unwrap(), 2);

        assert!(store.hash_delete("h", "a").await.unwrap());
        assert!(!store.hash_delete("h", "a").await.unwrap());
        assert_eq!(store.hash_len("h").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn set_membership() {
        let store = MemoryStore::new();
        store.set_add("s", "x").await.unwrap();
        store.set_add("s", "x").await.unwrap();
        store.set_add("s", "y").await.unwrap();

        assert_eq!(store.set_len("s").await.unwrap(), 2);
        store.set_remove("s", "x").await.unwrap();
        assert!(!store.set_members("s").await.unwrap().contains("x"));
    }

    #[tokio::test]
    async fn sorted_range_and_prune() {
        let store = MemoryStore::new();
        for (score, member) in [(1.0, "old"), (2.0, "mid"), (3.0, "new")] {
            store.sorted_add("log", score, member).await.unwrap();
        }

        let newest_first = store.sorted_rev_range("log", 0, 1).await.unwrap();
        assert_eq!(newest_first, vec!["new".to_string(), "mid".to_string()]);

        let removed = store.sorted_remove_below("log", 2.0).await.unwrap();
        assert_eq!(removed, 2);
        let rest = store.sorted_rev_range("log", 0, -1).await.unwrap();
        assert_eq!(rest, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn batch_applies_all_ops() {
        let store = MemoryStore::new();
        store
            .batch(vec![
                BatchOp::HashSet {
                    key: "k".into(),
                    field: "f".into(),
                    value: "v".into(),
                },
                BatchOp::HashIncrBy {
                    key: "k".into(),
                    field: "count".into(),
                    delta: 3,
                },
                BatchOp::HashIncrBy {
                    key: "k".into(),
                    field: "count".into(),
                    delta: 2,
                },
                BatchOp::Expire {
                    key: "k".into(),
                    seconds: 60,
                },
            ])
            .await
            .unwrap();

        assert_eq!(store.hash_get("k", "f").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.hash_get("k", "count").await.unwrap().as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn scan_prefix_filters_keys() {
        let store = MemoryStore::new();
        store.hash_set("rate:a:m1", "f", "1").await.unwrap();
        store.hash_set("rate:b:m1", "f", "1").await.unwrap();
        store.hash_set("credentials", "f", "1").await.unwrap();

        let keys = store.scan_prefix("rate:").await.unwrap();
        assert_eq!(keys, vec!["rate:a:m1".to_string(), "rate:b:m1".to_string()]);
    }
}
